use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::schemars::{self, JsonSchema};

pub mod workspace;
pub mod workspace_kind;

pub use workspace::{Workspace, WorkspaceVersion};
pub use workspace_kind::{WorkspaceKind, WorkspaceKindVersion};

pub mod v1alpha1 {
    pub use super::{workspace::v1alpha1::*, workspace_kind::v1alpha1::*};
}

pub const APP_NAME: &str = "workspace";

// Labels stamped on child objects. The name label routes pod events back to
// the owning workspace; the selector label is the immutable workload selector.
pub const WORKSPACE_NAME_LABEL: &str = "workspaces.dev/workspace-name";
pub const WORKSPACE_SELECTOR_LABEL: &str = "workspaces.dev/workspace-selector";

/// Finalizer that blocks deletion of a [`WorkspaceKind`] while workspaces
/// still reference it.
pub const KIND_PROTECTION_FINALIZER: &str = "workspaces.dev/protection";

pub const MAIN_CONTAINER_NAME: &str = "main";
pub const HOME_VOLUME_NAME: &str = "home-volume";
pub const DATA_VOLUME_NAME_PREFIX: &str = "data-volume-";
pub const HTTP_PORT_NAME_PREFIX: &str = "http-";

/// Length of the random suffix the apiserver appends to `generateName`.
pub const GENERATE_NAME_SUFFIX_LEN: usize = 6;

/// Services only need to satisfy the DNS-1035 limit.
pub const MAX_SERVICE_NAME_LEN: usize = 63;

/// StatefulSets additionally need room for the `-0` pod ordinal and the pod
/// hostname DNS constraints.
pub const MAX_STATEFULSET_NAME_LEN: usize = 52;

/// `generateName` prefix for a child of the given workspace, truncated so the
/// apiserver suffix still fits within `max_name_len`.
pub fn child_generate_name(workspace_name: &str, max_name_len: usize) -> String {
    let mut prefix = format!("ws-{workspace_name}-");
    let budget = max_name_len - GENERATE_NAME_SUFFIX_LEN;
    if prefix.len() > budget {
        prefix.truncate(budget);
    }
    prefix
}

/// Selector labels shared by the workload selector, the pod template and the
/// service selector of a workspace.
pub fn selector_labels(workspace_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            WORKSPACE_NAME_LABEL.to_string(),
            workspace_name.to_string(),
        ),
        (
            WORKSPACE_SELECTOR_LABEL.to_string(),
            workspace_name.to_string(),
        ),
    ])
}

/// Extra labels and annotations merged onto child pods. Kind-level entries
/// are applied first, workspace-level entries override them.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::short("alpha", MAX_SERVICE_NAME_LEN, "ws-alpha-")]
    #[case::short_sts("alpha", MAX_STATEFULSET_NAME_LEN, "ws-alpha-")]
    fn generate_name_keeps_short_prefixes(
        #[case] workspace: &str,
        #[case] max_len: usize,
        #[case] expected: &str,
    ) {
        assert_eq!(child_generate_name(workspace, max_len), expected);
    }

    #[rstest]
    #[case::service(MAX_SERVICE_NAME_LEN)]
    #[case::statefulset(MAX_STATEFULSET_NAME_LEN)]
    fn generate_name_respects_budget_for_longest_names(#[case] max_len: usize) {
        // 63 characters is the longest name the apiserver accepts.
        let workspace = "w".repeat(63);
        let prefix = child_generate_name(&workspace, max_len);
        assert_eq!(prefix.len(), max_len - GENERATE_NAME_SUFFIX_LEN);
        assert!(prefix.starts_with("ws-www"));
    }

    #[test]
    fn selector_labels_carry_the_workspace_name() {
        let labels = selector_labels("my-workspace");
        assert_eq!(
            labels.get(WORKSPACE_NAME_LABEL).map(String::as_str),
            Some("my-workspace")
        );
        assert_eq!(
            labels.get(WORKSPACE_SELECTOR_LABEL).map(String::as_str),
            Some("my-workspace")
        );
    }
}
