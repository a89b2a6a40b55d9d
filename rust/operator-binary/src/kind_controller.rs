//! Keeps the reference counts on each WorkspaceKind status and its
//! protection finalizer in sync with the workspaces that exist. The counts
//! feed the spawner UI and the admission checks for in-use immutability and
//! delete protection.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    kube::{
        self,
        api::{Api, ListParams, PostParams},
        core::{error_boundary, DeserializeGuard},
        runtime::controller::Action,
        ResourceExt,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    crd::{
        v1alpha1,
        workspace_kind::{OptionUsage, PodTemplateOptionsStatus, WorkspaceKindStatus},
        KIND_PROTECTION_FINALIZER,
    },
    store,
    validation::UsageCounts,
    OPERATOR_NAME,
};

pub const CONTROLLER_NAME: &str = "workspacekind-controller";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, '.', OPERATOR_NAME);

pub struct Ctx {
    pub client: stackable_operator::client::Client,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("WorkspaceKind object is invalid"))]
    InvalidWorkspaceKind {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("failed to list Workspaces"))]
    ListWorkspaces { source: kube::Error },

    #[snafu(display("failed to update WorkspaceKind finalizers"))]
    UpdateFinalizers { source: kube::Error },

    #[snafu(display("failed to serialize WorkspaceKind status"))]
    SerializeStatus { source: serde_json::Error },

    #[snafu(display("failed to update WorkspaceKind status"))]
    UpdateStatus { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_workspace_kind(
    kind: Arc<DeserializeGuard<v1alpha1::WorkspaceKind>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    let kind = kind
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidWorkspaceKindSnafu)?;

    let kube = ctx.client.as_kube_client();
    let name = kind.name_any();
    let kinds: Api<v1alpha1::WorkspaceKind> = Api::all(kube.clone());

    let workspaces: Vec<v1alpha1::Workspace> = Api::<v1alpha1::Workspace>::all(kube.clone())
        .list(&ListParams::default())
        .await
        .context(ListWorkspacesSnafu)?
        .items
        .into_iter()
        .filter(|workspace| workspace.spec.kind == name)
        .collect();
    let usage = UsageCounts::from_workspaces(&name, &workspaces);

    let has_finalizer = kind
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == KIND_PROTECTION_FINALIZER);

    if kind.metadata.deletion_timestamp.is_some() {
        // Admission blocks deletion while referenced; once the last
        // workspace is gone the finalizer is released so the delete can
        // complete.
        if has_finalizer && usage.total == 0 {
            let mut updated = kind.clone();
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .retain(|finalizer| finalizer != KIND_PROTECTION_FINALIZER);
            return match replace_kind(&kinds, &updated).await? {
                Some(_) => Ok(Action::await_change()),
                None => Ok(Action::requeue(Duration::ZERO)),
            };
        }
        return Ok(Action::await_change());
    }

    let mut kind = kind.clone();
    if usage.total > 0 && !has_finalizer {
        kind.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(KIND_PROTECTION_FINALIZER.to_string());
        // The status write below needs the fresh resourceVersion.
        kind = match replace_kind(&kinds, &kind).await? {
            Some(kind) => kind,
            None => return Ok(Action::requeue(Duration::ZERO)),
        };
    } else if usage.total == 0 && has_finalizer {
        kind.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .retain(|finalizer| finalizer != KIND_PROTECTION_FINALIZER);
        kind = match replace_kind(&kinds, &kind).await? {
            Some(kind) => kind,
            None => return Ok(Action::requeue(Duration::ZERO)),
        };
    }

    let status = WorkspaceKindStatus {
        workspaces: usage.total,
        pod_template_options: PodTemplateOptionsStatus {
            image_config: kind
                .image_config_values()
                .iter()
                .map(|value| OptionUsage {
                    id: value.id.clone(),
                    workspaces: usage.image_usage(&value.id),
                })
                .collect(),
            pod_config: kind
                .pod_config_values()
                .iter()
                .map(|value| OptionUsage {
                    id: value.id.clone(),
                    workspaces: usage.pod_usage(&value.id),
                })
                .collect(),
        },
    };

    if kind.status.as_ref() != Some(&status) {
        let mut updated = kind.clone();
        updated.status = Some(status);
        let data = serde_json::to_vec(&updated).context(SerializeStatusSnafu)?;
        match kinds
            .replace_status(&name, &PostParams::default(), data)
            .await
        {
            Ok(_) => (),
            Err(err) if store::is_conflict(&err) => return Ok(Action::requeue(Duration::ZERO)),
            Err(err) => return Err(Error::UpdateStatus { source: err }),
        }
    }

    Ok(Action::await_change())
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<v1alpha1::WorkspaceKind>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        Error::InvalidWorkspaceKind { .. } => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(10)),
    }
}

/// Replaces the kind, returning `None` on a write conflict so the caller
/// can requeue for a fresh object.
async fn replace_kind(
    kinds: &Api<v1alpha1::WorkspaceKind>,
    kind: &v1alpha1::WorkspaceKind,
) -> Result<Option<v1alpha1::WorkspaceKind>> {
    match kinds
        .replace(&kind.name_any(), &PostParams::default(), kind)
        .await
    {
        Ok(kind) => Ok(Some(kind)),
        Err(err) if store::is_conflict(&err) => Ok(None),
        Err(err) => Err(Error::UpdateFinalizers { source: err }),
    }
}
