//! The two activity probe variants. Probes never fail the reconcile; every
//! outcome is recorded on the workspace status and interpreted by the
//! culling ladder.

use std::time::Duration;

use serde::Deserialize;
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{Pod, Service},
        apimachinery::pkg::apis::meta::v1::Status as ExecStatus,
    },
    kube::{
        self,
        api::{Api, AttachParams},
        ResourceExt,
    },
};
use tokio::io::AsyncReadExt;

use crate::crd::{workspace::ProbeResult, workspace_kind::ActivityProbe, MAIN_CONTAINER_NAME};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Jupyter reports `last_activity` on its status endpoint.
pub const JUPYTER_ACTIVITY_PATH: &str = "/api/status";

#[derive(Debug)]
pub struct ProbeOutcome {
    pub result: ProbeResult,
    pub message: String,
    /// Unix seconds of the activity the probe observed, if any.
    pub last_activity: Option<i64>,
}

impl ProbeOutcome {
    fn failure(message: impl Into<String>) -> Self {
        ProbeOutcome {
            result: ProbeResult::Failure,
            message: message.into(),
            last_activity: None,
        }
    }

    fn timeout() -> Self {
        ProbeOutcome {
            result: ProbeResult::Timeout,
            message: format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs()),
            last_activity: None,
        }
    }
}

pub async fn run(
    http: &reqwest::Client,
    kube: &kube::Client,
    namespace: &str,
    probe: &ActivityProbe,
    service: Option<&Service>,
    pod_name: Option<&str>,
) -> ProbeOutcome {
    if let Some(exec) = &probe.exec {
        let Some(pod_name) = pod_name else {
            return ProbeOutcome::failure("workspace pod not found");
        };
        return exec_probe(kube, namespace, pod_name, &exec.command).await;
    }

    if probe.jupyter.is_some() {
        let Some(service) = service else {
            return ProbeOutcome::failure("workspace service not found");
        };
        let Some(port) = first_service_port(service) else {
            return ProbeOutcome::failure("workspace service exposes no ports");
        };
        let url = format!(
            "http://{service}.{namespace}.svc.cluster.local:{port}{JUPYTER_ACTIVITY_PATH}",
            service = service.name_any(),
        );
        return jupyter_probe(http, &url).await;
    }

    // Admission enforces exactly one variant, this is only reachable with a
    // kind that predates the webhook.
    ProbeOutcome::failure("no activity probe configured")
}

#[derive(Deserialize)]
struct JupyterStatus {
    last_activity: String,
}

async fn jupyter_probe(http: &reqwest::Client, url: &str) -> ProbeOutcome {
    let request = async {
        http.get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<JupyterStatus>()
            .await
    };

    let status = match tokio::time::timeout(PROBE_TIMEOUT, request).await {
        Err(_) => return ProbeOutcome::timeout(),
        Ok(Err(err)) => return ProbeOutcome::failure(format!("status request failed: {err}")),
        Ok(Ok(status)) => status,
    };

    match chrono::DateTime::parse_from_rfc3339(&status.last_activity) {
        Ok(timestamp) => ProbeOutcome {
            result: ProbeResult::Success,
            message: format!("last activity at {}", status.last_activity),
            last_activity: Some(timestamp.timestamp()),
        },
        Err(err) => ProbeOutcome::failure(format!(
            "could not parse last_activity {:?}: {err}",
            status.last_activity
        )),
    }
}

/// Runs the configured command in the main container. Exit code 0 means the
/// workspace was active within the last 60 seconds, so `last_activity` is
/// stamped with the current time; any other exit code reports idle.
async fn exec_probe(
    kube: &kube::Client,
    namespace: &str,
    pod_name: &str,
    command: &[String],
) -> ProbeOutcome {
    let pods: Api<Pod> = Api::namespaced(kube.clone(), namespace);
    let attach_params = AttachParams::default()
        .container(MAIN_CONTAINER_NAME)
        .stdin(false)
        .stdout(true)
        .stderr(true);

    let exec = async {
        let mut process = pods.exec(pod_name, command.to_vec(), &attach_params).await?;
        let status = process.take_status();

        let mut stderr = String::new();
        if let Some(mut reader) = process.stderr() {
            // Best effort; a command without stderr output is fine.
            let _ = reader.read_to_string(&mut stderr).await;
        }

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        process.join().await?;
        Ok::<_, kube::Error>((status, stderr))
    };

    let (status, stderr) = match tokio::time::timeout(PROBE_TIMEOUT, exec).await {
        Err(_) => return ProbeOutcome::timeout(),
        Ok(Err(err)) => return ProbeOutcome::failure(format!("exec failed: {err}")),
        Ok(Ok(result)) => result,
    };

    let Some(status) = status else {
        return ProbeOutcome::failure("exec finished without reporting a status");
    };

    match exit_code(&status) {
        Some(0) => ProbeOutcome {
            result: ProbeResult::Success,
            message: "activity within the last 60 seconds".to_string(),
            last_activity: Some(chrono::Utc::now().timestamp()),
        },
        Some(code) => ProbeOutcome {
            result: ProbeResult::Success,
            message: format!("idle, command exited with code {code}: {}", stderr.trim()),
            last_activity: None,
        },
        None => ProbeOutcome::failure(format!(
            "could not determine exit code: {}",
            status.message.unwrap_or_default()
        )),
    }
}

fn first_service_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.port)
}

fn exit_code(status: &ExecStatus) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.parse().ok())
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        Status, StatusCause, StatusDetails,
    };

    use super::*;

    #[test]
    fn success_status_is_exit_zero() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code(&status), Some(0));
    }

    #[test]
    fn non_zero_exit_code_is_extracted_from_the_cause() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("42".to_string()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(exit_code(&status), Some(42));
    }

    #[test]
    fn missing_cause_yields_no_exit_code() {
        let status = Status {
            status: Some("Failure".to_string()),
            message: Some("something else went wrong".to_string()),
            ..Status::default()
        };
        assert_eq!(exit_code(&status), None);
    }
}
