//! Activity-based idleness culling. Runs independently of the main
//! reconciler, probes running workspaces on a bounded interval and writes
//! `spec.paused = true` once a workspace has been idle for too long. The
//! main reconciler picks the spec change up and scales the workload to zero.

pub mod probe;

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service},
    kube::{
        self,
        api::{Api, PostParams},
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
        workspace::{ProbeResult, ProbeStatus, WorkspaceState, WorkspaceStatus},
        workspace_kind::CullingConfig,
    },
    store, OPERATOR_NAME,
};

pub const CONTROLLER_NAME: &str = "culling-controller";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, '.', OPERATOR_NAME);

/// Absorbs clock drift between the probe target and the controller when
/// comparing activity timestamps against `maxInactiveSeconds`.
pub const ACTIVITY_BUFFER_SECONDS: i64 = 30;

pub struct Ctx {
    pub client: stackable_operator::client::Client,
    pub http: reqwest::Client,
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

    #[snafu(display("failed to list owned {child_kind}s"))]
    ListChildren {
        source: kube::Error,
        child_kind: &'static str,
    },

    #[snafu(display("failed to serialize Workspace status"))]
    SerializeStatus { source: serde_json::Error },

    #[snafu(display("failed to record probe result"))]
    RecordProbe { source: kube::Error },

    #[snafu(display("failed to pause idle Workspace"))]
    PauseWorkspace { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// What the interval ladder decided for this pass.
#[derive(Debug, PartialEq)]
enum Decision {
    Requeue(i64),
    Probe,
}

/// The probe-interval ladder. All inputs are Unix seconds.
fn decide(
    now: i64,
    last_probe_end: i64,
    last_activity: i64,
    last_update: i64,
    culling: &CullingConfig,
) -> Decision {
    let since_probe = now - last_probe_end;
    let since_activity = now - last_activity;
    let since_update = now - last_update;

    if since_probe < culling.min_probe_interval_seconds {
        return Decision::Requeue(culling.max_probe_interval_seconds - since_probe);
    }
    if since_activity < culling.max_inactive_seconds {
        return Decision::Requeue(culling.max_probe_interval_seconds - since_probe);
    }
    if since_update < culling.max_probe_interval_seconds {
        return Decision::Requeue(culling.max_probe_interval_seconds - since_update);
    }
    Decision::Probe
}

pub async fn reconcile_culling(
    workspace: Arc<DeserializeGuard<v1alpha1::Workspace>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    let workspace = workspace
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidWorkspaceSnafu)?;

    if workspace.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let kube = ctx.client.as_kube_client();
    let namespace = workspace.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = workspace.name_any();

    let kinds: Api<v1alpha1::WorkspaceKind> = Api::all(kube.clone());
    let kind = match kinds
        .get_opt(&workspace.spec.kind)
        .await
        .context(GetWorkspaceKindSnafu {
            kind: workspace.spec.kind.clone(),
        })? {
        Some(kind) => kind,
        // The main reconciler reports this on status, nothing to cull here.
        None => return Ok(Action::await_change()),
    };

    // A kind without a culling block never cull-checks its workspaces. All
    // other skip conditions recheck after the probe interval, so flipping
    // the condition is picked up within one interval.
    let Some(culling) = kind.culling() else {
        return Ok(Action::await_change());
    };
    let idle_requeue = Action::requeue(Duration::from_secs(
        culling.max_probe_interval_seconds.max(1) as u64,
    ));

    if !culling.enabled
        || workspace.spec.disable_culling
        || workspace.spec.paused
        || workspace.state() != WorkspaceState::Running
    {
        return Ok(idle_requeue);
    }

    let activity = workspace.activity();
    let now = chrono::Utc::now().timestamp();
    let last_probe_end = activity
        .last_probe
        .as_ref()
        .map(|probe| probe.end_time_ms / 1000)
        .unwrap_or(0);

    match decide(
        now,
        last_probe_end,
        activity.last_activity,
        activity.last_update,
        culling,
    ) {
        Decision::Requeue(seconds) => {
            // Stale probe timestamps can push the delta below zero; fall
            // back to the idle interval instead of spinning.
            let seconds = if seconds > 0 {
                seconds
            } else {
                culling.max_probe_interval_seconds.max(1)
            };
            return Ok(Action::requeue(Duration::from_secs(seconds as u64)));
        }
        Decision::Probe => (),
    }

    // Locate the probe targets through the owned children.
    let uid = workspace.uid().context(ObjectMissingMetadataSnafu)?;
    let services: Api<Service> = Api::namespaced(kube.clone(), &namespace);
    let service = store::list_owned(&services, &name, &uid)
        .await
        .context(ListChildrenSnafu {
            child_kind: "Service",
        })?
        .into_iter()
        .next();
    let statefulsets: Api<StatefulSet> = Api::namespaced(kube.clone(), &namespace);
    let pod_name = store::list_owned(&statefulsets, &name, &uid)
        .await
        .context(ListChildrenSnafu {
            child_kind: "StatefulSet",
        })?
        .into_iter()
        .next()
        .map(|sts| format!("{}-0", sts.name_any()));

    let started_ms = chrono::Utc::now().timestamp_millis();
    let outcome = probe::run(
        &ctx.http,
        &kube,
        &namespace,
        &culling.activity_probe,
        service.as_ref(),
        pod_name.as_deref(),
    )
    .await;
    let ended_ms = chrono::Utc::now().timestamp_millis();
    let now = ended_ms / 1000;

    tracing::debug!(
        workspace = %name,
        result = %outcome.result,
        message = %outcome.message,
        "activity probe finished"
    );

    // Record the probe under optimistic concurrency; a conflict means the
    // object moved and the next delivery re-runs the ladder.
    let mut status = workspace.status.clone().unwrap_or_default();
    status.activity.last_probe = Some(ProbeStatus {
        start_time_ms: started_ms,
        end_time_ms: ended_ms,
        result: outcome.result,
        message: outcome.message,
    });
    if outcome.result == ProbeResult::Success {
        if let Some(last_activity) = outcome.last_activity {
            status.activity.last_activity = last_activity;
        }
        status.activity.last_update = now;
    }
    let last_activity = status.activity.last_activity;
    // The returned object carries the bumped resourceVersion, which the
    // pause write below needs.
    let workspace = match record_activity(&kube, &namespace, workspace, status).await {
        Ok(workspace) => workspace,
        Err(Error::RecordProbe { source }) if store::is_conflict(&source) => {
            return Ok(Action::requeue(Duration::ZERO));
        }
        Err(err) => return Err(err),
    };

    if outcome.result != ProbeResult::Success {
        // Probe failures never pause a workspace; retry on a short interval.
        return Ok(Action::requeue(Duration::from_secs(
            (culling.min_probe_interval_seconds + ACTIVITY_BUFFER_SECONDS).max(1) as u64,
        )));
    }

    if now - last_activity > culling.max_inactive_seconds + ACTIVITY_BUFFER_SECONDS {
        tracing::info!(
            workspace = %name,
            idle_seconds = now - last_activity,
            "workspace exceeded the inactivity limit, pausing"
        );
        let workspaces: Api<v1alpha1::Workspace> = Api::namespaced(kube.clone(), &namespace);
        let mut updated = workspace.clone();
        updated.spec.paused = true;
        match workspaces
            .replace(&name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => (),
            Err(err) if store::is_conflict(&err) => return Ok(Action::requeue(Duration::ZERO)),
            Err(err) => return Err(Error::PauseWorkspace { source: err }),
        }
    }

    Ok(idle_requeue)
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<v1alpha1::Workspace>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        Error::InvalidWorkspace { .. } => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(30)),
    }
}

async fn record_activity(
    kube: &kube::Client,
    namespace: &str,
    workspace: &v1alpha1::Workspace,
    status: WorkspaceStatus,
) -> Result<v1alpha1::Workspace> {
    let workspaces: Api<v1alpha1::Workspace> = Api::namespaced(kube.clone(), namespace);
    let mut updated = workspace.clone();
    updated.status = Some(status);
    let data = serde_json::to_vec(&updated).context(SerializeStatusSnafu)?;
    workspaces
        .replace_status(&updated.name_any(), &PostParams::default(), data)
        .await
        .context(RecordProbeSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::workspace_kind::{ActivityProbe, JupyterActivityProbe};

    fn culling() -> CullingConfig {
        CullingConfig {
            enabled: true,
            max_inactive_seconds: 3600,
            min_probe_interval_seconds: 60,
            max_probe_interval_seconds: 360,
            activity_probe: ActivityProbe {
                exec: None,
                jupyter: Some(JupyterActivityProbe {
                    last_activity: true,
                }),
            },
        }
    }

    #[test]
    fn recent_probe_defers_the_next_one() {
        // Probed 10 seconds ago, probe interval floor is 60.
        let decision = decide(1000, 990, 0, 0, &culling());
        assert_eq!(decision, Decision::Requeue(350));
    }

    #[test]
    fn known_activity_defers_probing() {
        // Last activity 100 seconds ago is well within maxInactiveSeconds.
        let decision = decide(10_000, 9000, 9900, 9000, &culling());
        assert_eq!(decision, Decision::Requeue(360 - 1000));
    }

    #[test]
    fn fresh_status_update_defers_probing() {
        // Idle beyond the limit, but the status block was written recently.
        let decision = decide(10_000, 6000, 1000, 9800, &culling());
        assert_eq!(decision, Decision::Requeue(360 - 200));
    }

    #[test]
    fn stale_workspace_is_probed() {
        let decision = decide(10_000, 6000, 1000, 6000, &culling());
        assert_eq!(decision, Decision::Probe);
    }

    #[test]
    fn never_probed_workspace_is_probed_once_idle() {
        // All timestamps at zero: sinceProbe/sinceActivity/sinceUpdate are
        // all large, so the ladder falls through to the probe.
        let decision = decide(100_000, 0, 0, 0, &culling());
        assert_eq!(decision, Decision::Probe);
    }
}
