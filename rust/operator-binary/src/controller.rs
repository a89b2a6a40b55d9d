//! Ensures that the child workload, service and ingress route exist and
//! match the declared state of each [`Workspace`](crate::crd::v1alpha1::Workspace),
//! and reports the observed lifecycle state back on its status.

use std::{fmt::Debug, sync::Arc, time::Duration};

use const_format::concatcp;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        apps::v1::StatefulSet,
        core::v1::{Pod, Service},
    },
    kube::{
        self,
        api::{Api, Patch, PatchParams, PostParams},
        core::{error_boundary, DeserializeGuard, NamespaceResourceScope},
        runtime::controller::Action,
        Resource, ResourceExt,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    crd::{
        v1alpha1,
        workspace::{
            OptionResolutionStatus, WorkspacePodOptionsStatus, WorkspaceState, WorkspaceStatus,
        },
    },
    options::{self, ResolvedOptions},
    service, state, statefulset, store,
    virtual_service::{self, VirtualService},
    OPERATOR_NAME,
};

pub const CONTROLLER_NAME: &str = "workspace-controller";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, '.', OPERATOR_NAME);
pub const FIELD_MANAGER_SCOPE: &str = "workspace";

pub struct Ctx {
    pub client: stackable_operator::client::Client,
    /// Istio gateway fronting workspace traffic. No VirtualServices are
    /// rendered when unset.
    pub istio_gateway: Option<String>,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Workspace object is invalid"))]
    InvalidWorkspace {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object has no namespace associated"))]
    ObjectHasNoNamespace,

    #[snafu(display("object is missing metadata"))]
    ObjectMissingMetadata,

    #[snafu(display("failed to get WorkspaceKind {kind:?}"))]
    GetWorkspaceKind { source: kube::Error, kind: String },

    #[snafu(display("Workspace references unknown WorkspaceKind {kind:?}"))]
    UnknownWorkspaceKind { kind: String },

    #[snafu(display(
        "Workspace is owned by WorkspaceKind uid {found:?}, expected {expected:?}; refusing to migrate"
    ))]
    OwnerMismatch { expected: String, found: String },

    #[snafu(display("failed to set owner reference on Workspace"))]
    ApplyOwnerReference { source: kube::Error },

    #[snafu(display("failed to resolve workspace options"))]
    ResolveOptions { source: options::Error },

    #[snafu(display("failed to promote deferred option updates"))]
    PromoteSpecOptions { source: kube::Error },

    #[snafu(display("failed to list owned {child_kind}s"))]
    ListChildren {
        source: kube::Error,
        child_kind: &'static str,
    },

    #[snafu(display("workspace has multiple workloads: {}", names.join(", ")))]
    MultipleWorkloads { names: Vec<String> },

    #[snafu(display("workspace has multiple services: {}", names.join(", ")))]
    MultipleServices { names: Vec<String> },

    #[snafu(display("failed to build StatefulSet"))]
    BuildStatefulSet { source: statefulset::Error },

    #[snafu(display("failed to build Service"))]
    BuildService { source: service::Error },

    #[snafu(display("failed to build VirtualService"))]
    BuildVirtualService { source: virtual_service::Error },

    #[snafu(display("failed to create {child_kind}"))]
    CreateChild {
        source: kube::Error,
        child_kind: &'static str,
    },

    #[snafu(display("failed to patch {child_kind}"))]
    PatchChild {
        source: kube::Error,
        child_kind: &'static str,
    },

    #[snafu(display("failed to serialize {child_kind}"))]
    SerializeChild {
        source: serde_json::Error,
        child_kind: &'static str,
    },

    #[snafu(display("failed to get pod {pod:?}"))]
    GetPod { source: kube::Error, pod: String },

    #[snafu(display("failed to serialize Workspace status"))]
    SerializeStatus { source: serde_json::Error },

    #[snafu(display("failed to update Workspace status"))]
    UpdateStatus { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl Error {
    /// Write races are not failures; the fresh object is re-delivered by an
    /// immediate requeue.
    fn requeues_immediately(&self) -> bool {
        match self {
            Error::ApplyOwnerReference { source }
            | Error::PromoteSpecOptions { source }
            | Error::UpdateStatus { source } => store::is_conflict(source),
            Error::CreateChild { source, .. } => store::is_already_exists(source),
            _ => false,
        }
    }

    /// Conditions that are terminal for this pass and surface on the
    /// workspace status instead of failing the reconcile.
    fn error_state_message(&self, name: &str) -> Option<String> {
        match self {
            Error::UnknownWorkspaceKind { .. } => Some(state::unknown_kind_message()),
            Error::ResolveOptions { source } => {
                Some(state::invalid_configuration_message(name, &source.to_string()))
            }
            Error::BuildStatefulSet { source } => {
                Some(state::invalid_configuration_message(name, &source.to_string()))
            }
            Error::BuildService { source } => {
                Some(state::invalid_configuration_message(name, &source.to_string()))
            }
            Error::BuildVirtualService { source } => {
                Some(state::invalid_configuration_message(name, &source.to_string()))
            }
            Error::MultipleWorkloads { names } => {
                Some(state::multiple_workloads_message(name, names))
            }
            Error::MultipleServices { names } => {
                Some(state::multiple_services_message(name, names))
            }
            Error::CreateChild { source, child_kind } | Error::PatchChild { source, child_kind }
                if store::is_invalid(source) =>
            {
                Some(state::invalid_configuration_message(
                    name,
                    &format!("{child_kind} was rejected: {source}"),
                ))
            }
            _ => None,
        }
    }
}

pub async fn reconcile_workspace(
    workspace: Arc<DeserializeGuard<v1alpha1::Workspace>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");

    let workspace = workspace
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidWorkspaceSnafu)?;

    // Cascading deletion takes care of the children.
    if workspace.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let kube = ctx.client.as_kube_client();
    let namespace = workspace.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = workspace.name_any();
    let workspaces: Api<v1alpha1::Workspace> = Api::namespaced(kube.clone(), &namespace);

    match reconcile_inner(workspace.clone(), &workspaces, ctx.as_ref(), &namespace).await {
        Ok(action) => Ok(action),
        Err(err) if err.requeues_immediately() => Ok(Action::requeue(Duration::ZERO)),
        Err(err) => match err.error_state_message(&name) {
            Some(message) => {
                tracing::warn!(error = &err as &dyn std::error::Error, "workspace entered Error state");
                let mut status = workspace.status.clone().unwrap_or_default();
                status.state = WorkspaceState::Error;
                status.state_message = message;
                match write_status(&workspaces, workspace, status).await {
                    Ok(()) => Ok(Action::await_change()),
                    Err(status_err) if status_err.requeues_immediately() => {
                        Ok(Action::requeue(Duration::ZERO))
                    }
                    Err(status_err) => Err(status_err),
                }
            }
            None => Err(err),
        },
    }
}

async fn reconcile_inner(
    mut workspace: v1alpha1::Workspace,
    workspaces: &Api<v1alpha1::Workspace>,
    ctx: &Ctx,
    namespace: &str,
) -> Result<Action> {
    let kube = ctx.client.as_kube_client();
    let name = workspace.name_any();

    // Kind resolution
    let kinds: Api<v1alpha1::WorkspaceKind> = Api::all(kube.clone());
    let kind = kinds
        .get_opt(&workspace.spec.kind)
        .await
        .context(GetWorkspaceKindSnafu {
            kind: workspace.spec.kind.clone(),
        })?
        .context(UnknownWorkspaceKindSnafu {
            kind: workspace.spec.kind.clone(),
        })?;

    // Ownership: the kind owns the workspace so it cannot be deleted from
    // underneath it.
    if let Some(owned) = ensure_kind_ownership(workspaces, &workspace, &kind).await? {
        workspace = owned;
    }

    // Option resolution
    let mut options =
        options::resolve_workspace_options(&workspace, &kind).context(ResolveOptionsSnafu)?;

    // Deferred-update promotion: the single place this controller writes to
    // the spec.
    if workspace.spec.paused && !workspace.spec.defer_updates && options.pending_restart() {
        workspace = promote_spec_options(workspaces, &workspace, &options).await?;
        options =
            options::resolve_workspace_options(&workspace, &kind).context(ResolveOptionsSnafu)?;
    }

    let uid = workspace.uid().context(ObjectMissingMetadataSnafu)?;

    // Children: service first, the workload references its name.
    let services: Api<Service> = Api::namespaced(kube.clone(), namespace);
    let existing_services = store::list_owned(&services, &name, &uid)
        .await
        .context(ListChildrenSnafu {
            child_kind: "Service",
        })?;
    if existing_services.len() > 1 {
        return MultipleServicesSnafu {
            names: names_of(&existing_services),
        }
        .fail();
    }
    let desired_service =
        service::build_workspace_service(&workspace, &options).context(BuildServiceSnafu)?;
    let service = reconcile_child(
        &services,
        existing_services.into_iter().next(),
        desired_service,
        "Service",
    )
    .await?;
    let service_name = service.name_any();

    let statefulsets: Api<StatefulSet> = Api::namespaced(kube.clone(), namespace);
    let existing_statefulsets = store::list_owned(&statefulsets, &name, &uid)
        .await
        .context(ListChildrenSnafu {
            child_kind: "StatefulSet",
        })?;
    if existing_statefulsets.len() > 1 {
        return MultipleWorkloadsSnafu {
            names: names_of(&existing_statefulsets),
        }
        .fail();
    }
    let desired_statefulset =
        statefulset::build_workspace_statefulset(&workspace, &kind, &options, &service_name)
            .context(BuildStatefulSetSnafu)?;
    let workload = reconcile_child(
        &statefulsets,
        existing_statefulsets.into_iter().next(),
        desired_statefulset,
        "StatefulSet",
    )
    .await?;

    if let Some(gateway) = &ctx.istio_gateway {
        let virtual_services: Api<VirtualService> = Api::namespaced(kube.clone(), namespace);
        let mut existing = store::list_owned(&virtual_services, &name, &uid)
            .await
            .context(ListChildrenSnafu {
                child_kind: "VirtualService",
            })?;
        if existing.len() > 1 {
            tracing::warn!(
                virtual_services = ?names_of(&existing),
                "workspace has duplicate VirtualServices, converging the first"
            );
            existing.truncate(1);
        }
        let desired = virtual_service::build_workspace_virtual_service(
            &workspace,
            &kind,
            &options,
            &service_name,
            gateway,
        )
        .context(BuildVirtualServiceSnafu)?;
        reconcile_child(&virtual_services, existing.pop(), desired, "VirtualService").await?;
    }

    // Pod observation
    let pods: Api<Pod> = Api::namespaced(kube.clone(), namespace);
    let pod_name = format!("{}-0", workload.name_any());
    let pod = pods
        .get_opt(&pod_name)
        .await
        .context(GetPodSnafu { pod: pod_name })?;

    // Status
    let previous = workspace.status.clone().unwrap_or_default();
    let (state, state_message) = state::assess(&name, workspace.spec.paused, pod.as_ref());
    let status = WorkspaceStatus {
        state,
        state_message,
        pause_time: next_pause_time(
            workspace.spec.paused,
            previous.pause_time,
            chrono::Utc::now().timestamp(),
        ),
        pending_restart: options.pending_restart(),
        pod_template_options: WorkspacePodOptionsStatus {
            image_config: OptionResolutionStatus {
                desired: options.image.desired.id.clone(),
                redirect_chain: options.image.redirect_chain.clone(),
            },
            pod_config: OptionResolutionStatus {
                desired: options.pod.desired.id.clone(),
                redirect_chain: options.pod.redirect_chain.clone(),
            },
        },
        activity: previous.activity.clone(),
    };
    write_status(workspaces, &workspace, status).await?;

    Ok(Action::await_change())
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<v1alpha1::Workspace>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        // An invalid object cannot become valid on its own, wait for an edit.
        Error::InvalidWorkspace { .. } => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}

/// Returns the persisted workspace when an owner reference had to be written.
async fn ensure_kind_ownership(
    workspaces: &Api<v1alpha1::Workspace>,
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
) -> Result<Option<v1alpha1::Workspace>> {
    let kind_uid = kind.uid().context(ObjectMissingMetadataSnafu)?;

    if let Some(owner) = workspace
        .owner_references()
        .iter()
        .find(|owner| owner.kind == "WorkspaceKind")
    {
        if owner.uid != kind_uid {
            return OwnerMismatchSnafu {
                expected: kind_uid,
                found: owner.uid.clone(),
            }
            .fail();
        }
        return Ok(None);
    }

    let mut updated = workspace.clone();
    updated
        .metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(
            kind.controller_owner_ref(&())
                .context(ObjectMissingMetadataSnafu)?,
        );
    let persisted = workspaces
        .replace(&updated.name_any(), &PostParams::default(), &updated)
        .await
        .context(ApplyOwnerReferenceSnafu)?;
    Ok(Some(persisted))
}

/// Rewrites the selected option ids to their redirect targets. Only called
/// while the workspace is paused and updates are not deferred.
async fn promote_spec_options(
    workspaces: &Api<v1alpha1::Workspace>,
    workspace: &v1alpha1::Workspace,
    options: &ResolvedOptions<'_>,
) -> Result<v1alpha1::Workspace> {
    let mut updated = workspace.clone();
    updated.spec.pod_template.options.image_config = options.image.desired.id.clone();
    updated.spec.pod_template.options.pod_config = options.pod.desired.id.clone();

    tracing::info!(
        image_config = %options.image.desired.id,
        pod_config = %options.pod.desired.id,
        "promoting deferred option updates"
    );
    workspaces
        .replace(&updated.name_any(), &PostParams::default(), &updated)
        .await
        .context(PromoteSpecOptionsSnafu)
}

/// Creates the child when absent, otherwise server-side-applies the rendered
/// state under this controller's field manager. The apiserver diffs against
/// the fields the manager owns, so a field the renderer no longer sets is
/// cleared as well; an apply with no changes is a no-op that does not bump
/// the resourceVersion.
async fn reconcile_child<K>(
    api: &Api<K>,
    existing: Option<K>,
    mut desired: K,
    child_kind: &'static str,
) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    let Some(existing) = existing else {
        tracing::info!(child_kind, "creating child");
        return store::create_with_retry(api, &desired)
            .await
            .context(CreateChildSnafu { child_kind });
    };

    let existing_name = existing.name_any();
    {
        let meta = desired.meta_mut();
        meta.name = Some(existing_name.clone());
        meta.generate_name = None;
    }

    // Apply patches must carry their own type metadata.
    let mut patch = serde_json::to_value(&desired).context(SerializeChildSnafu { child_kind })?;
    patch["apiVersion"] = serde_json::Value::String(K::api_version(&()).into_owned());
    patch["kind"] = serde_json::Value::String(K::kind(&()).into_owned());

    tracing::debug!(child_kind, name = %existing_name, "applying child");
    api.patch(
        &existing_name,
        &PatchParams::apply(FIELD_MANAGER_SCOPE).force(),
        &Patch::Apply(&patch),
    )
    .await
    .context(PatchChildSnafu { child_kind })
}

async fn write_status(
    workspaces: &Api<v1alpha1::Workspace>,
    workspace: &v1alpha1::Workspace,
    status: WorkspaceStatus,
) -> Result<()> {
    if workspace.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let mut updated = workspace.clone();
    updated.status = Some(status);
    let data = serde_json::to_vec(&updated).context(SerializeStatusSnafu)?;
    workspaces
        .replace_status(&updated.name_any(), &PostParams::default(), data)
        .await
        .context(UpdateStatusSnafu)?;
    Ok(())
}

fn next_pause_time(paused: bool, previous: i64, now: i64) -> i64 {
    match (paused, previous) {
        (false, _) => 0,
        (true, 0) => now,
        (true, previous) => previous,
    }
}

fn names_of<K: Resource>(objects: &[K]) -> Vec<String> {
    objects.iter().map(|obj| obj.name_any()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_time_is_stamped_once_and_cleared_on_resume() {
        // pause transition stamps the current time
        assert_eq!(next_pause_time(true, 0, 1000), 1000);
        // further reconciles keep the original timestamp
        assert_eq!(next_pause_time(true, 1000, 2000), 1000);
        // resuming clears it
        assert_eq!(next_pause_time(false, 1000, 3000), 0);
        assert_eq!(next_pause_time(false, 0, 3000), 0);
    }
}
