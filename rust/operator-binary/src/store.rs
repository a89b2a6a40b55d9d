//! Narrow typed surface over the apiserver used by the reconcilers and the
//! admission server: owner-filtered child listing, bounded create retries and
//! classification of the error conditions the callers branch on.

use std::{fmt::Debug, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use serde::{de::DeserializeOwned, Serialize};
use stackable_operator::kube::{
    self,
    api::{Api, ListParams, PostParams},
    core::ErrorResponse,
    Resource, ResourceExt,
};

use crate::crd::WORKSPACE_NAME_LABEL;

/// Creates are retried a bounded number of times with geometric backoff;
/// anything that survives this is surfaced to the reconciler.
pub const CREATE_RETRY_ATTEMPTS: usize = 5;
pub const CREATE_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: 404, .. }))
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason == "Conflict")
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}

/// Admission rejections (either ours or the apiserver's schema validation).
pub fn is_invalid(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: 422, .. }))
}

/// Lists the children of a workspace through the workspace-name label and
/// keeps only objects whose controller owner is the given workspace UID.
/// Children are created through `generateName`, so this is the only way to
/// find them.
pub async fn list_owned<K>(
    api: &Api<K>,
    workspace_name: &str,
    workspace_uid: &str,
) -> Result<Vec<K>, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let params =
        ListParams::default().labels(&format!("{WORKSPACE_NAME_LABEL}={workspace_name}"));
    let children = api.list(&params).await?;
    Ok(children
        .items
        .into_iter()
        .filter(|child| {
            child.owner_references().iter().any(|owner| {
                owner.controller.unwrap_or(false) && owner.uid == workspace_uid
            })
        })
        .collect())
}

/// Create with bounded geometric retry. `AlreadyExists` and `Invalid` are
/// not retried; the caller decides what either means.
pub async fn create_with_retry<K>(api: &Api<K>, obj: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let create = || async { api.create(&PostParams::default(), obj).await };
    create
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(CREATE_RETRY_BASE_DELAY)
                .with_max_times(CREATE_RETRY_ATTEMPTS),
        )
        .when(|err| !(is_already_exists(err) || is_invalid(err)))
        .await
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::{self, core::ErrorResponse};

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn conflict_and_already_exists_share_a_code_but_not_a_reason() {
        let conflict = api_error(409, "Conflict");
        let already_exists = api_error(409, "AlreadyExists");

        assert!(is_conflict(&conflict));
        assert!(!is_already_exists(&conflict));
        assert!(is_already_exists(&already_exists));
        assert!(!is_conflict(&already_exists));
    }

    #[test]
    fn not_found_and_invalid_are_classified_by_code() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(is_invalid(&api_error(422, "Invalid")));
        assert!(!is_invalid(&api_error(404, "NotFound")));
    }
}
