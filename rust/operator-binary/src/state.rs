//! Maps pod observations and spec flags to the `(state, stateMessage)` pair
//! reported on a workspace. The table is evaluated top-down; the first
//! matching row wins, so callers get deterministic messages for a given
//! observation.

use stackable_operator::k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use crate::crd::{workspace::WorkspaceState, MAIN_CONTAINER_NAME};

const REASON_CRASH_LOOP: &str = "CrashLoopBackOff";
const REASON_IMAGE_PULL: &str = "ImagePullBackOff";
const REASON_CONTAINER_CREATING: &str = "ContainerCreating";

pub fn unknown_kind_message() -> String {
    "Workspace references unknown WorkspaceKind".to_string()
}

pub fn invalid_configuration_message(name: &str, detail: &str) -> String {
    format!("Workspace {name} has an invalid configuration: {detail}")
}

pub fn multiple_workloads_message(name: &str, names: &[String]) -> String {
    format!(
        "Workspace {name} has multiple workloads: {list}",
        list = names.join(", ")
    )
}

pub fn multiple_services_message(name: &str, names: &[String]) -> String {
    format!(
        "Workspace {name} has multiple services: {list}",
        list = names.join(", ")
    )
}

/// The pod-observation rows of the decision table. Duplicate-children rows
/// are raised by the reconciler before it ever reads the pod, via the
/// dedicated message helpers above.
pub fn assess(name: &str, paused: bool, pod: Option<&Pod>) -> (WorkspaceState, String) {
    if let Some(pod) = pod {
        if pod.metadata.deletion_timestamp.is_some() {
            return (
                WorkspaceState::Terminating,
                format!("Workspace {name} is terminating"),
            );
        }
    } else if paused {
        return (
            WorkspaceState::Paused,
            format!("Workspace {name} is paused"),
        );
    }

    if let Some(pod) = pod {
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref());
        let main = main_container_status(pod);

        if phase == Some("Running") && main.map(|c| c.ready).unwrap_or(false) {
            return (
                WorkspaceState::Running,
                format!("Workspace {name} is running"),
            );
        }

        if let Some(reason) = waiting_reason(main) {
            match reason {
                REASON_CRASH_LOOP => {
                    return (
                        WorkspaceState::Error,
                        format!("Workspace {name} container is in CrashLoopBackOff"),
                    );
                }
                REASON_IMAGE_PULL => {
                    return (
                        WorkspaceState::Error,
                        format!("Workspace {name} cannot pull image"),
                    );
                }
                REASON_CONTAINER_CREATING => {
                    return (
                        WorkspaceState::Pending,
                        format!("Workspace {name} is creating its container"),
                    );
                }
                _ => (),
            }
        }

        if phase == Some("Pending") {
            return (
                WorkspaceState::Pending,
                format!("Workspace {name} pod is pending"),
            );
        }
    }

    (
        WorkspaceState::Unknown,
        format!("Workspace {name} is in an unknown state"),
    )
}

fn main_container_status(pod: &Pod) -> Option<&ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .find(|status| status.name == MAIN_CONTAINER_NAME)
        })
}

fn waiting_reason<'a>(main: Option<&'a ContainerStatus>) -> Option<&'a str> {
    main.and_then(|status| status.state.as_ref())
        .and_then(|state| state.waiting.as_ref())
        .and_then(|waiting| waiting.reason.as_deref())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use stackable_operator::k8s_openapi::api::core::v1::Pod;

    use super::*;

    fn pod(input: &str) -> Pod {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    #[test]
    fn paused_without_pod_is_paused() {
        let (state, message) = assess("ws1", true, None);
        assert_eq!(state, WorkspaceState::Paused);
        assert_eq!(message, "Workspace ws1 is paused");
    }

    #[test]
    fn no_pod_and_not_paused_is_unknown() {
        let (state, message) = assess("ws1", false, None);
        assert_eq!(state, WorkspaceState::Unknown);
        assert_eq!(message, "Workspace ws1 is in an unknown state");
    }

    #[test]
    fn deleting_pod_wins_over_everything() {
        let pod = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
              deletionTimestamp: "2026-01-01T00:00:00Z"
            status:
              phase: Running
        "#);
        let (state, message) = assess("ws1", true, Some(&pod));
        assert_eq!(state, WorkspaceState::Terminating);
        assert_eq!(message, "Workspace ws1 is terminating");
    }

    #[test]
    fn ready_main_container_is_running() {
        let pod = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Running
              containerStatuses:
                - name: main
                  ready: true
                  restartCount: 0
                  image: img
                  imageID: img
        "#);
        let (state, message) = assess("ws1", false, Some(&pod));
        assert_eq!(state, WorkspaceState::Running);
        assert_eq!(message, "Workspace ws1 is running");
    }

    #[rstest]
    #[case::crash_loop(
        "CrashLoopBackOff",
        WorkspaceState::Error,
        "Workspace ws1 container is in CrashLoopBackOff"
    )]
    #[case::image_pull(
        "ImagePullBackOff",
        WorkspaceState::Error,
        "Workspace ws1 cannot pull image"
    )]
    #[case::creating(
        "ContainerCreating",
        WorkspaceState::Pending,
        "Workspace ws1 is creating its container"
    )]
    fn waiting_reasons_map_to_the_catalog(
        #[case] reason: &str,
        #[case] expected_state: WorkspaceState,
        #[case] expected_message: &str,
    ) {
        let pod = pod(&format!(
            r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Pending
              containerStatuses:
                - name: main
                  ready: false
                  restartCount: 0
                  image: img
                  imageID: img
                  state:
                    waiting:
                      reason: {reason}
        "#
        ));
        let (state, message) = assess("ws1", false, Some(&pod));
        assert_eq!(state, expected_state);
        assert_eq!(message, expected_message);
    }

    #[test]
    fn pending_phase_without_waiting_reason_is_pending() {
        let pod = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Pending
        "#);
        let (state, message) = assess("ws1", false, Some(&pod));
        assert_eq!(state, WorkspaceState::Pending);
        assert_eq!(message, "Workspace ws1 pod is pending");
    }

    #[test]
    fn running_but_unready_container_is_unknown() {
        let pod = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Running
              containerStatuses:
                - name: main
                  ready: false
                  restartCount: 3
                  image: img
                  imageID: img
        "#);
        let (state, _) = assess("ws1", false, Some(&pod));
        assert_eq!(state, WorkspaceState::Unknown);
    }

    #[test]
    fn creation_sequence_produces_pending_pending_running() {
        let creating = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Pending
              containerStatuses:
                - name: main
                  ready: false
                  restartCount: 0
                  image: img
                  imageID: img
                  state:
                    waiting:
                      reason: ContainerCreating
        "#);
        let started = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Pending
        "#);
        let ready = pod(r#"
            metadata:
              name: ws-ws1-abcde-0
            status:
              phase: Running
              containerStatuses:
                - name: main
                  ready: true
                  restartCount: 0
                  image: img
                  imageID: img
        "#);

        let states: Vec<WorkspaceState> = [creating, started, ready]
            .iter()
            .map(|pod| assess("ws1", false, Some(pod)).0)
            .collect();
        assert_eq!(
            states,
            vec![
                WorkspaceState::Pending,
                WorkspaceState::Pending,
                WorkspaceState::Running
            ]
        );
    }

    #[test]
    fn duplicate_children_messages_list_all_names() {
        assert_eq!(
            multiple_workloads_message(
                "ws1",
                &["ws-ws1-aaaaa".to_string(), "ws-ws1-bbbbb".to_string()]
            ),
            "Workspace ws1 has multiple workloads: ws-ws1-aaaaa, ws-ws1-bbbbb"
        );
        assert_eq!(
            multiple_services_message("ws1", &["svc-a".to_string(), "svc-b".to_string()]),
            "Workspace ws1 has multiple services: svc-a, svc-b"
        );
    }
}
