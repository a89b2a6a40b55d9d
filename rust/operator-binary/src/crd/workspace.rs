use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
    versioned::versioned,
};
use strum::Display;

use crate::crd::PodMetadata;

#[versioned(
    version(name = "v1alpha1"),
    crates(
        kube_core = "stackable_operator::kube::core",
        kube_client = "stackable_operator::kube::client",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars",
        versioned = "stackable_operator::versioned"
    )
)]
pub mod versioned {
    /// A Workspace is a user's named instance of an interactive development
    /// environment, stamped out from a WorkspaceKind.
    #[versioned(crd(
        group = "workspaces.dev",
        plural = "workspaces",
        shortname = "ws",
        status = "WorkspaceStatus",
        namespaced
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WorkspaceSpec {
        /// Name of the WorkspaceKind this workspace is built from.
        /// Immutable after creation.
        pub kind: String,

        /// Paused workspaces keep their declared state but run zero pods.
        #[serde(default)]
        pub paused: bool,

        /// Inhibits automatic promotion of pending option updates while the
        /// workspace is paused.
        #[serde(default)]
        pub defer_updates: bool,

        /// Opts this workspace out of idleness culling even when its kind
        /// enables it.
        #[serde(default)]
        pub disable_culling: bool,

        pub pod_template: WorkspacePodTemplate,
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodTemplate {
    /// Extra labels and annotations for the child pod. Entries here win over
    /// kind-supplied ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<PodMetadata>,

    pub volumes: WorkspaceVolumes,

    pub options: WorkspaceOptions,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceVolumes {
    /// Name of a user-owned PersistentVolumeClaim mounted at the kind's home
    /// mount path. No home volume is mounted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,

    #[serde(default)]
    pub data: Vec<DataVolume>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVolume {
    pub pvc_name: String,

    pub mount_path: String,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceOptions {
    /// Id of an imageConfig option of the referenced kind.
    pub image_config: String,

    /// Id of a podConfig option of the referenced kind.
    pub pod_config: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    #[serde(default)]
    pub state: WorkspaceState,

    #[serde(default)]
    pub state_message: String,

    /// Unix seconds at which the pause took effect, 0 while not paused.
    #[serde(default)]
    pub pause_time: i64,

    /// True while the selected options differ from their redirect targets.
    #[serde(default)]
    pub pending_restart: bool,

    #[serde(default)]
    pub pod_template_options: WorkspacePodOptionsStatus,

    #[serde(default)]
    pub activity: WorkspaceActivity,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum WorkspaceState {
    Running,
    Pending,
    Paused,
    Terminating,
    Error,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePodOptionsStatus {
    #[serde(default)]
    pub image_config: OptionResolutionStatus,

    #[serde(default)]
    pub pod_config: OptionResolutionStatus,
}

/// Where the selected option ends up after following redirects. Persisted so
/// user interfaces can explain a pending restart without re-resolving.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionResolutionStatus {
    #[serde(default)]
    pub desired: String,

    #[serde(default)]
    pub redirect_chain: Vec<RedirectStep>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectStep {
    pub source: String,

    pub target: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceActivity {
    /// Unix seconds of the last observed user activity.
    #[serde(default)]
    pub last_activity: i64,

    /// Unix seconds at which the culling controller last wrote this block.
    #[serde(default)]
    pub last_update: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<ProbeStatus>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    pub start_time_ms: i64,

    pub end_time_ms: i64,

    pub result: ProbeResult,

    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ProbeResult {
    Success,
    Failure,
    Timeout,
}

impl v1alpha1::Workspace {
    pub fn image_config_id(&self) -> &str {
        &self.spec.pod_template.options.image_config
    }

    pub fn pod_config_id(&self) -> &str {
        &self.spec.pod_template.options.pod_config
    }

    pub fn state(&self) -> WorkspaceState {
        self.status
            .as_ref()
            .map(|status| status.state)
            .unwrap_or_default()
    }

    pub fn activity(&self) -> WorkspaceActivity {
        self.status
            .as_ref()
            .map(|status| status.activity.clone())
            .unwrap_or_default()
    }
}
