//! Resolves the image and pod selections of a workspace by following the
//! redirect chains declared on its [`WorkspaceKind`](crate::crd::v1alpha1::WorkspaceKind).

use std::collections::HashMap;

use snafu::{OptionExt, Snafu};
use strum::Display;

use crate::crd::{
    v1alpha1,
    workspace::RedirectStep,
    workspace_kind::{ImageConfigValue, PodConfigValue},
};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum OptionFamily {
    #[strum(serialize = "imageConfig")]
    ImageConfig,
    #[strum(serialize = "podConfig")]
    PodConfig,
}

#[derive(Snafu, Debug, PartialEq)]
pub enum Error {
    #[snafu(display("option {id:?} does not exist in {family}"))]
    OptionNotFound { family: OptionFamily, id: String },

    #[snafu(display("{family} redirects contain a cycle: {}", cycle.join(" -> ")))]
    RedirectCycle {
        family: OptionFamily,
        cycle: Vec<String>,
    },

    #[snafu(display("{family} option {from:?} redirects to unknown option {to:?}"))]
    RedirectTargetMissing {
        family: OptionFamily,
        from: String,
        to: String,
    },
}

/// Anything that can participate in a redirect graph. Implemented by the two
/// option families of a WorkspaceKind.
pub trait OptionValue {
    fn id(&self) -> &str;
    fn redirect_to(&self) -> Option<&str>;
}

impl OptionValue for ImageConfigValue {
    fn id(&self) -> &str {
        &self.id
    }

    fn redirect_to(&self) -> Option<&str> {
        self.redirect.as_ref().map(|redirect| redirect.to.as_str())
    }
}

impl OptionValue for PodConfigValue {
    fn id(&self) -> &str {
        &self.id
    }

    fn redirect_to(&self) -> Option<&str> {
        self.redirect.as_ref().map(|redirect| redirect.to.as_str())
    }
}

/// Resolution result for one option family. `current` is what the workspace
/// selects, `desired` the terminal node of the redirect walk.
#[derive(Debug)]
pub struct Resolved<'a, T> {
    pub current: &'a T,
    pub desired: &'a T,
    pub redirect_chain: Vec<RedirectStep>,
}

impl<T: OptionValue> Resolved<'_, T> {
    pub fn pending_restart(&self) -> bool {
        self.current.id() != self.desired.id()
    }
}

#[derive(Debug)]
pub struct ResolvedOptions<'a> {
    pub image: Resolved<'a, ImageConfigValue>,
    pub pod: Resolved<'a, PodConfigValue>,
}

impl ResolvedOptions<'_> {
    pub fn pending_restart(&self) -> bool {
        self.image.pending_restart() || self.pod.pending_restart()
    }
}

pub fn resolve_workspace_options<'a>(
    workspace: &v1alpha1::Workspace,
    kind: &'a v1alpha1::WorkspaceKind,
) -> Result<ResolvedOptions<'a>, Error> {
    Ok(ResolvedOptions {
        image: resolve(
            OptionFamily::ImageConfig,
            kind.image_config_values(),
            workspace.image_config_id(),
        )?,
        pod: resolve(
            OptionFamily::PodConfig,
            kind.pod_config_values(),
            workspace.pod_config_id(),
        )?,
    })
}

/// Walks the redirect chain starting at `current_id`. The walk keeps a
/// visited list, so a chain that loops back to any earlier node (including a
/// self-redirect) is reported as a cycle with all participating ids.
pub fn resolve<'a, T: OptionValue>(
    family: OptionFamily,
    values: &'a [T],
    current_id: &str,
) -> Result<Resolved<'a, T>, Error> {
    let by_id: HashMap<&str, &T> = values.iter().map(|value| (value.id(), value)).collect();

    let current = *by_id.get(current_id).context(OptionNotFoundSnafu {
        family,
        id: current_id,
    })?;

    let mut node = current;
    let mut visited = vec![current.id().to_string()];
    let mut redirect_chain = Vec::new();

    while let Some(to) = node.redirect_to() {
        if let Some(start) = visited.iter().position(|id| id == to) {
            let mut cycle = visited.split_off(start);
            cycle.push(to.to_string());
            return RedirectCycleSnafu { family, cycle }.fail();
        }
        let target = *by_id.get(to).context(RedirectTargetMissingSnafu {
            family,
            from: node.id(),
            to,
        })?;
        redirect_chain.push(RedirectStep {
            source: node.id().to_string(),
            target: to.to_string(),
        });
        visited.push(to.to_string());
        node = target;
    }

    Ok(Resolved {
        current,
        desired: node,
        redirect_chain,
    })
}

/// Validates the whole redirect graph of one family: every target must exist
/// and no walk may revisit a node. The first cycle aborts validation of the
/// remaining redirects in this family.
pub fn validate_redirects<T: OptionValue>(family: OptionFamily, values: &[T]) -> Result<(), Error> {
    for value in values {
        if value.redirect_to().is_none() {
            continue;
        }
        resolve(family, values, value.id()).map(drop)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::crd::workspace_kind::{ImageConfigSpec, OptionRedirect, OptionSpawnerInfo};

    fn image_value(id: &str, redirect_to: Option<&str>) -> ImageConfigValue {
        ImageConfigValue {
            id: id.to_string(),
            spawner: OptionSpawnerInfo {
                display_name: id.to_string(),
                description: None,
                hidden: false,
            },
            redirect: redirect_to.map(|to| OptionRedirect {
                to: to.to_string(),
                message: None,
            }),
            spec: ImageConfigSpec {
                image: format!("registry.example.com/{id}:latest"),
                image_pull_policy: None,
                ports: Vec::new(),
            },
        }
    }

    #[test]
    fn option_without_redirect_resolves_to_itself() {
        let values = vec![image_value("img-a", None)];
        let resolved = resolve(OptionFamily::ImageConfig, &values, "img-a").unwrap();

        assert_eq!(resolved.current.id, "img-a");
        assert_eq!(resolved.desired.id, "img-a");
        assert!(resolved.redirect_chain.is_empty());
        assert!(!resolved.pending_restart());
    }

    #[rstest]
    #[case::single_hop(1)]
    #[case::long_chain(7)]
    fn redirect_chain_is_followed_to_the_terminal_node(#[case] hops: usize) {
        let mut values = Vec::new();
        for i in 0..hops {
            values.push(image_value(&format!("img-{i}"), Some(&format!("img-{}", i + 1))));
        }
        values.push(image_value(&format!("img-{hops}"), None));

        let resolved = resolve(OptionFamily::ImageConfig, &values, "img-0").unwrap();

        assert_eq!(resolved.current.id, "img-0");
        assert_eq!(resolved.desired.id, format!("img-{hops}"));
        assert_eq!(resolved.redirect_chain.len(), hops);
        assert_eq!(resolved.redirect_chain[0].source, "img-0");
        assert_eq!(
            resolved.redirect_chain.last().unwrap().target,
            format!("img-{hops}")
        );
        assert!(resolved.pending_restart());
    }

    #[test]
    fn unknown_current_option_is_reported() {
        let values = vec![image_value("img-a", None)];
        let err = resolve(OptionFamily::ImageConfig, &values, "missing").unwrap_err();

        assert_eq!(
            err,
            Error::OptionNotFound {
                family: OptionFamily::ImageConfig,
                id: "missing".to_string(),
            }
        );
    }

    #[test]
    fn missing_redirect_target_is_reported_with_both_ends() {
        let values = vec![image_value("img-a", Some("img-gone"))];
        let err = resolve(OptionFamily::ImageConfig, &values, "img-a").unwrap_err();

        assert_eq!(
            err,
            Error::RedirectTargetMissing {
                family: OptionFamily::ImageConfig,
                from: "img-a".to_string(),
                to: "img-gone".to_string(),
            }
        );
    }

    #[test]
    fn two_node_cycle_names_both_nodes() {
        let values = vec![
            image_value("img-a", Some("img-b")),
            image_value("img-b", Some("img-a")),
        ];
        let err = resolve(OptionFamily::ImageConfig, &values, "img-a").unwrap_err();

        match err {
            Error::RedirectCycle { cycle, .. } => {
                assert_eq!(cycle, vec!["img-a", "img-b", "img-a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_redirect_is_a_cycle() {
        let values = vec![image_value("img-a", Some("img-a"))];
        let err = resolve(OptionFamily::ImageConfig, &values, "img-a").unwrap_err();

        match err {
            Error::RedirectCycle { cycle, .. } => assert_eq!(cycle, vec!["img-a", "img-a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_behind_a_tail_only_reports_the_looping_nodes() {
        // a -> b -> c -> b: the cycle is b/c, a is only the entry point.
        let values = vec![
            image_value("img-a", Some("img-b")),
            image_value("img-b", Some("img-c")),
            image_value("img-c", Some("img-b")),
        ];
        let err = resolve(OptionFamily::ImageConfig, &values, "img-a").unwrap_err();

        match err {
            Error::RedirectCycle { cycle, .. } => {
                assert_eq!(cycle, vec!["img-b", "img-c", "img-b"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn graph_validation_accepts_chains_and_rejects_cycles() {
        let acyclic = vec![
            image_value("img-a", Some("img-b")),
            image_value("img-b", Some("img-c")),
            image_value("img-c", None),
        ];
        validate_redirects(OptionFamily::ImageConfig, &acyclic).unwrap();

        let cyclic = vec![
            image_value("img-a", Some("img-b")),
            image_value("img-b", Some("img-a")),
        ];
        let err = validate_redirects(OptionFamily::ImageConfig, &cyclic).unwrap_err();
        assert!(matches!(err, Error::RedirectCycle { .. }));
    }
}
