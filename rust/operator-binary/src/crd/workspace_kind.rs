use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::{
        Affinity, PodSecurityContext, Probe, ResourceRequirements, SecurityContext, Toleration,
    },
    kube::CustomResource,
    schemars::{self, JsonSchema},
    versioned::versioned,
};

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
    /// A WorkspaceKind is a cluster-wide template cataloging the images, pod
    /// shapes and proxy behavior available to Workspaces. Operators publish
    /// kinds; end users only pick options from them.
    #[versioned(crd(
        group = "workspaces.dev",
        plural = "workspacekinds",
        shortname = "wsk",
        status = "WorkspaceKindStatus"
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WorkspaceKindSpec {
        /// Presentation metadata shown by spawner user interfaces.
        pub spawner: SpawnerInfo,

        /// The pod template all workspaces of this kind are built from.
        pub pod_template: KindPodTemplate,
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnerInfo {
    /// Human readable name of this kind.
    pub display_name: String,

    /// Short description of what the kind provides.
    pub description: String,

    /// Deprecated kinds are still reconciled but spawner UIs should steer
    /// users away from them. Selecting one returns an admission warning.
    #[serde(default)]
    pub deprecated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_message: Option<String>,

    /// Hidden kinds are not listed by spawner UIs.
    #[serde(default)]
    pub hidden: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<ImageRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<ImageRef>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindPodTemplate {
    /// Extra labels and annotations applied to all child pods. Mutable;
    /// changes are reflected on the next reconcile of each workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<PodMetadata>,

    /// The identity child pods run under. Immutable while any workspace
    /// references this kind.
    pub service_account: ServiceAccountConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culling: Option<CullingConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<KindProbes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_security_context: Option<SecurityContext>,

    /// Immutable while any workspace references this kind.
    pub volume_mounts: KindVolumeMounts,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxyConfig>,

    /// Environment variables for the main container. Values are templates
    /// with a single callable, `httpPathPrefix(portId="...")`.
    #[serde(default)]
    pub extra_env: Vec<TemplatedEnvVar>,

    pub options: KindOptions,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountConfig {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CullingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds without activity after which the workspace is paused.
    #[serde(default = "CullingConfig::default_max_inactive_seconds")]
    pub max_inactive_seconds: i64,

    /// Lower bound between two activity probes of the same workspace.
    #[serde(default = "CullingConfig::default_min_probe_interval_seconds")]
    pub min_probe_interval_seconds: i64,

    /// Upper bound; also the idle requeue interval of the culling controller.
    #[serde(default = "CullingConfig::default_max_probe_interval_seconds")]
    pub max_probe_interval_seconds: i64,

    pub activity_probe: ActivityProbe,
}

impl CullingConfig {
    const fn default_max_inactive_seconds() -> i64 {
        86400
    }

    const fn default_min_probe_interval_seconds() -> i64 {
        60
    }

    const fn default_max_probe_interval_seconds() -> i64 {
        360
    }
}

/// How workspace activity is measured. Exactly one variant must be set;
/// admission rejects kinds that set both or neither.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecActivityProbe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jupyter: Option<JupyterActivityProbe>,
}

/// Runs a command in the main container. Exit code 0 means the workspace saw
/// activity within the last 60 seconds.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecActivityProbe {
    pub command: Vec<String>,
}

/// Queries the Jupyter status endpoint and reads its `last_activity` field.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JupyterActivityProbe {
    #[serde(default = "JupyterActivityProbe::default_last_activity")]
    pub last_activity: bool,
}

impl JupyterActivityProbe {
    const fn default_last_activity() -> bool {
        true
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindProbes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindVolumeMounts {
    /// In-container mount path of the home volume.
    pub home: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxyConfig {
    /// Rewrite the request URI to `/` before it reaches the container.
    #[serde(default)]
    pub remove_path_prefix: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<RequestHeaderRules>,
}

/// Header rewriting applied by the ingress layer. `set` and `add` values are
/// templates with the same surface as `extraEnv`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderRules {
    #[serde(default)]
    pub set: BTreeMap<String, String>,

    #[serde(default)]
    pub add: BTreeMap<String, String>,

    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatedEnvVar {
    pub name: String,

    pub value: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindOptions {
    pub image_config: ImageConfig,

    pub pod_config: PodConfig,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Id selected for workspaces that do not choose an image explicitly.
    /// Must exist in `values`.
    pub default: String,

    pub values: Vec<ImageConfigValue>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfigValue {
    pub id: String,

    pub spawner: OptionSpawnerInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<OptionRedirect>,

    /// Immutable while any workspace references this option.
    pub spec: ImageConfigSpec,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfigSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    pub ports: Vec<ImagePort>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePort {
    /// Port id used in ingress paths and by `httpPathPrefix`.
    pub id: String,

    pub display_name: String,

    pub port: i32,

    #[serde(default = "ImagePort::default_protocol")]
    pub protocol: String,
}

impl ImagePort {
    fn default_protocol() -> String {
        "TCP".to_string()
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    /// Id selected for workspaces that do not choose a pod shape explicitly.
    /// Must exist in `values`.
    pub default: String,

    pub values: Vec<PodConfigValue>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigValue {
    pub id: String,

    pub spawner: OptionSpawnerInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<OptionRedirect>,

    /// Immutable while any workspace references this option.
    pub spec: PodConfigSpec,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSpawnerInfo {
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub hidden: bool,
}

/// Points a retired option at its replacement. Workspaces still selecting the
/// source id report a pending restart until they are paused and promoted.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionRedirect {
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceKindStatus {
    /// Number of workspaces referencing this kind.
    #[serde(default)]
    pub workspaces: i64,

    #[serde(default)]
    pub pod_template_options: PodTemplateOptionsStatus,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateOptionsStatus {
    #[serde(default)]
    pub image_config: Vec<OptionUsage>,

    #[serde(default)]
    pub pod_config: Vec<OptionUsage>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionUsage {
    pub id: String,

    /// Number of workspaces currently selecting this option.
    pub workspaces: i64,
}

impl v1alpha1::WorkspaceKind {
    pub fn image_config_values(&self) -> &[ImageConfigValue] {
        &self.spec.pod_template.options.image_config.values
    }

    pub fn pod_config_values(&self) -> &[PodConfigValue] {
        &self.spec.pod_template.options.pod_config.values
    }

    pub fn find_image_config(&self, id: &str) -> Option<&ImageConfigValue> {
        self.image_config_values().iter().find(|value| value.id == id)
    }

    pub fn find_pod_config(&self, id: &str) -> Option<&PodConfigValue> {
        self.pod_config_values().iter().find(|value| value.id == id)
    }

    pub fn culling(&self) -> Option<&CullingConfig> {
        self.spec.pod_template.culling.as_ref()
    }
}
