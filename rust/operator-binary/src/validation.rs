//! Admission-time validation for both custom resources. The functions here
//! are pure; the webhook layer turns their field errors into admission
//! responses, and the reconcilers rely on them having run (a kind that made
//! it into the store has a parseable template surface and an acyclic
//! redirect graph).

use std::{collections::BTreeMap, fmt};

use stackable_operator::{
    cpu::CpuQuantity,
    k8s_openapi::{
        api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
    },
    kube::ResourceExt,
    memory::MemoryQuantity,
};

use crate::{
    crd::{v1alpha1, KIND_PROTECTION_FINALIZER},
    options::{self, OptionFamily, OptionValue},
    template::{self, PathPrefixContext},
};

/// One rejected field, in the shape admission responses are built from.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{field}: {message} (got {value:?})",
            field = self.field,
            message = self.message,
            value = self.value
        )
    }
}

pub fn format_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub mod workspace_kind {
    use super::*;

    pub fn validate_create(kind: &v1alpha1::WorkspaceKind) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let template_ctx = probe_template_context(kind);

        for (index, env) in kind.spec.pod_template.extra_env.iter().enumerate() {
            if let Err(err) = template::validate(&env.value, &template_ctx) {
                errors.push(FieldError {
                    field: format!("spec.podTemplate.extraEnv[{index}].value"),
                    value: env.value.clone(),
                    message: err.to_string(),
                });
            }
        }

        if let Some(rules) = kind
            .spec
            .pod_template
            .http_proxy
            .as_ref()
            .and_then(|proxy| proxy.request_headers.as_ref())
        {
            for (name, value) in rules.set.iter().chain(rules.add.iter()) {
                if let Err(err) = template::validate(value, &template_ctx) {
                    errors.push(FieldError {
                        field: format!("spec.podTemplate.httpProxy.requestHeaders[{name}]"),
                        value: value.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Some(culling) = kind.culling() {
            let probe = &culling.activity_probe;
            match (&probe.exec, &probe.jupyter) {
                (Some(_), Some(_)) => errors.push(FieldError {
                    field: "spec.podTemplate.culling.activityProbe".to_string(),
                    value: "exec, jupyter".to_string(),
                    message: "only one probe variant may be set".to_string(),
                }),
                (None, None) => errors.push(FieldError {
                    field: "spec.podTemplate.culling.activityProbe".to_string(),
                    value: String::new(),
                    message: "one of exec or jupyter must be set".to_string(),
                }),
                _ => (),
            }
            if culling.min_probe_interval_seconds > culling.max_probe_interval_seconds {
                errors.push(FieldError {
                    field: "spec.podTemplate.culling.minProbeIntervalSeconds".to_string(),
                    value: culling.min_probe_interval_seconds.to_string(),
                    message: "must not exceed maxProbeIntervalSeconds".to_string(),
                });
            }
        }

        errors.extend(validate_unique_ids(
            OptionFamily::ImageConfig,
            kind.image_config_values(),
        ));
        errors.extend(validate_unique_ids(
            OptionFamily::PodConfig,
            kind.pod_config_values(),
        ));
        errors.extend(validate_image_ports(kind));

        if let Err(err) =
            options::validate_redirects(OptionFamily::ImageConfig, kind.image_config_values())
        {
            errors.push(redirect_error(OptionFamily::ImageConfig, err));
        }
        if let Err(err) =
            options::validate_redirects(OptionFamily::PodConfig, kind.pod_config_values())
        {
            errors.push(redirect_error(OptionFamily::PodConfig, err));
        }

        errors.extend(validate_default(
            OptionFamily::ImageConfig,
            &kind.spec.pod_template.options.image_config.default,
            kind.image_config_values(),
        ));
        errors.extend(validate_default(
            OptionFamily::PodConfig,
            &kind.spec.pod_template.options.pod_config.default,
            kind.pod_config_values(),
        ));

        errors
    }

    pub fn validate_update(
        old: &v1alpha1::WorkspaceKind,
        new: &v1alpha1::WorkspaceKind,
        usage: &UsageCounts,
    ) -> Vec<FieldError> {
        // Create-time rules always hold; they are cheap and pure, so re-run
        // them wholesale instead of tracking which ids changed.
        let mut errors = validate_create(new);

        if usage.total > 0 {
            if old.spec.pod_template.service_account != new.spec.pod_template.service_account {
                errors.push(FieldError {
                    field: "spec.podTemplate.serviceAccount.name".to_string(),
                    value: new.spec.pod_template.service_account.name.clone(),
                    message: "is in use and cannot be changed".to_string(),
                });
            }
            if old.spec.pod_template.volume_mounts != new.spec.pod_template.volume_mounts {
                errors.push(FieldError {
                    field: "spec.podTemplate.volumeMounts.home".to_string(),
                    value: new.spec.pod_template.volume_mounts.home.clone(),
                    message: "is in use and cannot be changed".to_string(),
                });
            }
        }

        for old_value in old.image_config_values() {
            let usage_count = usage.image_usage(&old_value.id);
            match new.find_image_config(&old_value.id) {
                Some(new_value) => {
                    if usage_count > 0 && old_value.spec != new_value.spec {
                        errors.push(in_use_change_error(
                            OptionFamily::ImageConfig,
                            &old_value.id,
                            usage_count,
                        ));
                    }
                }
                None => {
                    if usage_count > 0 {
                        errors.push(in_use_removal_error(
                            OptionFamily::ImageConfig,
                            &old_value.id,
                            usage_count,
                        ));
                    }
                }
            }
        }

        for old_value in old.pod_config_values() {
            let usage_count = usage.pod_usage(&old_value.id);
            match new.find_pod_config(&old_value.id) {
                Some(new_value) => {
                    if usage_count > 0
                        && normalized_pod_spec(&old_value.spec)
                            != normalized_pod_spec(&new_value.spec)
                    {
                        errors.push(in_use_change_error(
                            OptionFamily::PodConfig,
                            &old_value.id,
                            usage_count,
                        ));
                    }
                }
                None => {
                    if usage_count > 0 {
                        errors.push(in_use_removal_error(
                            OptionFamily::PodConfig,
                            &old_value.id,
                            usage_count,
                        ));
                    }
                }
            }
        }

        errors
    }

    pub fn validate_delete(kind: &v1alpha1::WorkspaceKind) -> Vec<FieldError> {
        let workspaces = kind
            .status
            .as_ref()
            .map(|status| status.workspaces)
            .unwrap_or(0);
        if workspaces > 0 {
            return vec![FieldError {
                field: "status.workspaces".to_string(),
                value: workspaces.to_string(),
                message: format!(
                    "is referenced by {workspaces} workspaces and cannot be deleted; delete the workspaces first"
                ),
            }];
        }
        if kind
            .finalizers()
            .iter()
            .any(|finalizer| finalizer == KIND_PROTECTION_FINALIZER)
        {
            return vec![FieldError {
                field: "metadata.finalizers".to_string(),
                value: KIND_PROTECTION_FINALIZER.to_string(),
                message: "protection finalizer is still present; delete the referencing workspaces instead of removing the finalizer"
                    .to_string(),
            }];
        }
        Vec::new()
    }

    /// A representative context for admission-time template rendering: it
    /// carries every port id any image option declares, so a valid
    /// `httpPathPrefix` call renders no matter which option is selected.
    fn probe_template_context(kind: &v1alpha1::WorkspaceKind) -> PathPrefixContext {
        PathPrefixContext {
            namespace: "default".to_string(),
            workspace_name: kind.name_any(),
            port_ids: kind
                .image_config_values()
                .iter()
                .flat_map(|value| value.spec.ports.iter())
                .map(|port| port.id.clone())
                .collect(),
        }
    }

    fn validate_unique_ids<T: OptionValue>(family: OptionFamily, values: &[T]) -> Vec<FieldError> {
        let mut seen = BTreeMap::new();
        let mut errors = Vec::new();
        for value in values {
            if seen.insert(value.id().to_string(), ()).is_some() {
                errors.push(FieldError {
                    field: format!("spec.podTemplate.options.{family}.values[{}]", value.id()),
                    value: value.id().to_string(),
                    message: "id is declared more than once".to_string(),
                });
            }
        }
        errors
    }

    fn validate_image_ports(kind: &v1alpha1::WorkspaceKind) -> Vec<FieldError> {
        let mut errors = Vec::new();
        for value in kind.image_config_values() {
            let mut seen = BTreeMap::new();
            for port in &value.spec.ports {
                if seen.insert(port.port, ()).is_some() {
                    errors.push(FieldError {
                        field: format!(
                            "spec.podTemplate.options.imageConfig.values[{}].spec.ports",
                            value.id
                        ),
                        value: port.port.to_string(),
                        message: "port number is declared more than once".to_string(),
                    });
                }
            }
        }
        errors
    }

    fn validate_default<T: OptionValue>(
        family: OptionFamily,
        default: &str,
        values: &[T],
    ) -> Vec<FieldError> {
        if values.iter().any(|value| value.id() == default) {
            return Vec::new();
        }
        vec![FieldError {
            field: format!("spec.podTemplate.options.{family}.default"),
            value: default.to_string(),
            message: "does not exist in values".to_string(),
        }]
    }

    fn redirect_error(family: OptionFamily, err: options::Error) -> FieldError {
        let value = match &err {
            options::Error::RedirectCycle { cycle, .. } => cycle.join(" -> "),
            options::Error::RedirectTargetMissing { to, .. } => to.clone(),
            options::Error::OptionNotFound { id, .. } => id.clone(),
        };
        FieldError {
            field: format!("spec.podTemplate.options.{family}.values"),
            value,
            message: err.to_string(),
        }
    }

    fn in_use_change_error(family: OptionFamily, id: &str, usage: i64) -> FieldError {
        FieldError {
            field: format!("spec.podTemplate.options.{family}.values[{id}].spec"),
            value: id.to_string(),
            message: format!("is in use by {usage} workspaces and cannot be changed"),
        }
    }

    fn in_use_removal_error(family: OptionFamily, id: &str, usage: i64) -> FieldError {
        FieldError {
            field: format!("spec.podTemplate.options.{family}.values[{id}]"),
            value: id.to_string(),
            message: format!("is in use by {usage} workspaces and cannot be removed"),
        }
    }
}

/// Per-option usage, sourced from the kind status when the status controller
/// has populated it, otherwise counted from a live workspace listing.
#[derive(Clone, Debug, Default)]
pub struct UsageCounts {
    pub total: i64,
    pub image: BTreeMap<String, i64>,
    pub pod: BTreeMap<String, i64>,
}

impl UsageCounts {
    pub fn from_status(kind: &v1alpha1::WorkspaceKind) -> Option<Self> {
        let status = kind.status.as_ref()?;
        Some(UsageCounts {
            total: status.workspaces,
            image: status
                .pod_template_options
                .image_config
                .iter()
                .map(|usage| (usage.id.clone(), usage.workspaces))
                .collect(),
            pod: status
                .pod_template_options
                .pod_config
                .iter()
                .map(|usage| (usage.id.clone(), usage.workspaces))
                .collect(),
        })
    }

    pub fn from_workspaces(kind_name: &str, workspaces: &[v1alpha1::Workspace]) -> Self {
        let mut counts = UsageCounts::default();
        for workspace in workspaces {
            if workspace.spec.kind != kind_name {
                continue;
            }
            counts.total += 1;
            *counts
                .image
                .entry(workspace.image_config_id().to_string())
                .or_default() += 1;
            *counts
                .pod
                .entry(workspace.pod_config_id().to_string())
                .or_default() += 1;
        }
        counts
    }

    pub fn image_usage(&self, id: &str) -> i64 {
        self.image.get(id).copied().unwrap_or(0)
    }

    pub fn pod_usage(&self, id: &str) -> i64 {
        self.pod.get(id).copied().unwrap_or(0)
    }
}

/// Pod option specs compare after normalization: empty maps and lists count
/// as absent, and resource quantities compare in canonical form so `1000m`
/// and `1` cpu are the same value.
fn normalized_pod_spec(
    spec: &crate::crd::workspace_kind::PodConfigSpec,
) -> crate::crd::workspace_kind::PodConfigSpec {
    crate::crd::workspace_kind::PodConfigSpec {
        affinity: spec.affinity.clone(),
        node_selector: spec
            .node_selector
            .clone()
            .filter(|selector| !selector.is_empty()),
        tolerations: spec
            .tolerations
            .clone()
            .filter(|tolerations| !tolerations.is_empty()),
        resources: spec
            .resources
            .clone()
            .map(normalized_resources)
            .filter(|resources| *resources != ResourceRequirements::default()),
    }
}

fn normalized_resources(mut resources: ResourceRequirements) -> ResourceRequirements {
    resources.requests = resources
        .requests
        .map(canonical_quantities)
        .filter(|map| !map.is_empty());
    resources.limits = resources
        .limits
        .map(canonical_quantities)
        .filter(|map| !map.is_empty());
    resources.claims = resources.claims.filter(|claims| !claims.is_empty());
    resources
}

fn canonical_quantities(map: BTreeMap<String, Quantity>) -> BTreeMap<String, Quantity> {
    map.into_iter()
        .map(|(key, quantity)| {
            let canonical = canonical_quantity(&key, &quantity);
            (key, canonical)
        })
        .collect()
}

fn canonical_quantity(key: &str, quantity: &Quantity) -> Quantity {
    if key == "cpu" {
        if let Ok(cpu) = CpuQuantity::try_from(quantity) {
            return cpu.into();
        }
    } else if key == "memory" {
        if let Ok(memory) = MemoryQuantity::try_from(quantity) {
            return memory.into();
        }
    }
    quantity.clone()
}

pub mod workspace {
    use super::*;

    pub fn validate_create(
        workspace: &v1alpha1::Workspace,
        kind: Option<&v1alpha1::WorkspaceKind>,
    ) -> (Vec<FieldError>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let Some(kind) = kind else {
            errors.push(unknown_kind_error(workspace));
            return (errors, warnings);
        };

        if kind.spec.spawner.deprecated {
            warnings.push(deprecation_warning(kind));
        }
        validate_options(workspace, kind, &mut errors, &mut warnings);

        (errors, warnings)
    }

    pub fn validate_update(
        old: &v1alpha1::Workspace,
        new: &v1alpha1::Workspace,
        kind: Option<&v1alpha1::WorkspaceKind>,
    ) -> (Vec<FieldError>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if old.spec.kind != new.spec.kind {
            errors.push(FieldError {
                field: "spec.kind".to_string(),
                value: new.spec.kind.clone(),
                message: "is immutable".to_string(),
            });
            return (errors, warnings);
        }

        let options_changed = old.spec.pod_template.options != new.spec.pod_template.options;
        if options_changed {
            match kind {
                Some(kind) => validate_options(new, kind, &mut errors, &mut warnings),
                None => errors.push(unknown_kind_error(new)),
            }
        }

        (errors, warnings)
    }

    /// Selected options must resolve; selecting an option that is being
    /// redirected away is allowed but surfaces the redirect message as a
    /// warning.
    fn validate_options(
        workspace: &v1alpha1::Workspace,
        kind: &v1alpha1::WorkspaceKind,
        errors: &mut Vec<FieldError>,
        warnings: &mut Vec<String>,
    ) {
        match options::resolve(
            OptionFamily::ImageConfig,
            kind.image_config_values(),
            workspace.image_config_id(),
        ) {
            Ok(resolved) => {
                if let Some(message) = redirect_message(&resolved.current.redirect) {
                    warnings.push(format!(
                        "imageConfig option {:?}: {message}",
                        workspace.image_config_id()
                    ));
                }
            }
            Err(err) => errors.push(FieldError {
                field: "spec.podTemplate.options.imageConfig".to_string(),
                value: workspace.image_config_id().to_string(),
                message: err.to_string(),
            }),
        }
        match options::resolve(
            OptionFamily::PodConfig,
            kind.pod_config_values(),
            workspace.pod_config_id(),
        ) {
            Ok(resolved) => {
                if let Some(message) = redirect_message(&resolved.current.redirect) {
                    warnings.push(format!(
                        "podConfig option {:?}: {message}",
                        workspace.pod_config_id()
                    ));
                }
            }
            Err(err) => errors.push(FieldError {
                field: "spec.podTemplate.options.podConfig".to_string(),
                value: workspace.pod_config_id().to_string(),
                message: err.to_string(),
            }),
        }
    }

    fn redirect_message(
        redirect: &Option<crate::crd::workspace_kind::OptionRedirect>,
    ) -> Option<&str> {
        redirect
            .as_ref()
            .and_then(|redirect| redirect.message.as_deref())
    }

    fn unknown_kind_error(workspace: &v1alpha1::Workspace) -> FieldError {
        FieldError {
            field: "spec.kind".to_string(),
            value: workspace.spec.kind.clone(),
            message: "references unknown WorkspaceKind".to_string(),
        }
    }

    fn deprecation_warning(kind: &v1alpha1::WorkspaceKind) -> String {
        match &kind.spec.spawner.deprecation_message {
            Some(message) => format!("WorkspaceKind {} is deprecated: {message}", kind.name_any()),
            None => format!("WorkspaceKind {} is deprecated", kind.name_any()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(input: &str) -> v1alpha1::WorkspaceKind {
        serde_yaml::from_str(input).expect("illegal test input")
    }

    fn base_kind() -> v1alpha1::WorkspaceKind {
        kind(r#"
        apiVersion: workspaces.dev/v1alpha1
        kind: WorkspaceKind
        metadata:
          name: jupyterlab
        spec:
          spawner:
            displayName: JupyterLab
            description: A web-based notebook environment
          podTemplate:
            serviceAccount:
              name: workspace-default-editor
            volumeMounts:
              home: /home/user
            options:
              imageConfig:
                default: img-a
                values:
                  - id: img-a
                    spawner:
                      displayName: Notebook 2025a
                    spec:
                      image: registry.example.com/notebook:2025a
                      ports:
                        - id: jupyterlab
                          displayName: JupyterLab
                          port: 8888
              podConfig:
                default: pod-a
                values:
                  - id: pod-a
                    spawner:
                      displayName: Small CPU
                    spec:
                      resources:
                        requests:
                          cpu: 1000m
        "#)
    }

    fn workspace(image: &str, pod: &str) -> v1alpha1::Workspace {
        serde_yaml::from_str(&format!(
            r#"
            apiVersion: workspaces.dev/v1alpha1
            kind: Workspace
            metadata:
              name: my-workspace
              namespace: team-a
            spec:
              kind: jupyterlab
              podTemplate:
                volumes: {{}}
                options:
                  imageConfig: {image}
                  podConfig: {pod}
            "#
        ))
        .expect("illegal test input")
    }

    #[test]
    fn valid_kind_passes_create_validation() {
        assert_eq!(workspace_kind::validate_create(&base_kind()), Vec::new());
    }

    #[test]
    fn redirect_cycle_is_rejected_naming_both_nodes() {
        let mut bad = base_kind();
        let values = &mut bad.spec.pod_template.options.image_config.values;
        let mut second = values[0].clone();
        second.id = "img-b".to_string();
        second.redirect = Some(crate::crd::workspace_kind::OptionRedirect {
            to: "img-a".to_string(),
            message: None,
        });
        values[0].redirect = Some(crate::crd::workspace_kind::OptionRedirect {
            to: "img-b".to_string(),
            message: None,
        });
        values.push(second);

        let errors = workspace_kind::validate_create(&bad);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cycle"));
        assert!(errors[0].value.contains("img-a"));
        assert!(errors[0].value.contains("img-b"));
    }

    #[test]
    fn duplicate_ports_within_an_image_are_rejected() {
        let mut bad = base_kind();
        let ports = &mut bad.spec.pod_template.options.image_config.values[0]
            .spec
            .ports;
        let mut dup = ports[0].clone();
        dup.id = "other".to_string();
        ports.push(dup);

        let errors = workspace_kind::validate_create(&bad);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].field,
            "spec.podTemplate.options.imageConfig.values[img-a].spec.ports"
        );
    }

    #[test]
    fn missing_default_is_rejected() {
        let mut bad = base_kind();
        bad.spec.pod_template.options.pod_config.default = "pod-gone".to_string();

        let errors = workspace_kind::validate_create(&bad);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.podTemplate.options.podConfig.default");
    }

    #[test]
    fn bad_extra_env_template_is_rejected() {
        let mut bad = base_kind();
        bad.spec.pod_template.extra_env = vec![crate::crd::workspace_kind::TemplatedEnvVar {
            name: "BROKEN".to_string(),
            value: "{% for x in y %}{% endfor %}".to_string(),
        }];

        let errors = workspace_kind::validate_create(&bad);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.podTemplate.extraEnv[0].value");
    }

    #[test]
    fn in_use_pod_option_change_is_rejected_with_the_field_path() {
        let old = base_kind();
        let mut new = base_kind();
        new.spec.pod_template.options.pod_config.values[0]
            .spec
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert("cpu".to_string(), Quantity("2".to_string()));

        let usage = UsageCounts::from_workspaces("jupyterlab", &[workspace("img-a", "pod-a")]);
        let errors = workspace_kind::validate_update(&old, &new, &usage);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].field,
            "spec.podTemplate.options.podConfig.values[pod-a].spec"
        );
        assert!(errors[0].message.contains("in use"));
    }

    #[test]
    fn equivalent_quantity_spelling_is_not_a_change() {
        let old = base_kind();
        let mut new = base_kind();
        // 1000m and 1 are the same amount of cpu.
        new.spec.pod_template.options.pod_config.values[0]
            .spec
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert("cpu".to_string(), Quantity("1".to_string()));

        let usage = UsageCounts::from_workspaces("jupyterlab", &[workspace("img-a", "pod-a")]);
        assert_eq!(workspace_kind::validate_update(&old, &new, &usage), Vec::new());
    }

    #[test]
    fn unused_option_may_change_and_be_removed() {
        let old = base_kind();
        let mut new = base_kind();
        new.spec.pod_template.options.image_config.values[0].spec.image =
            "registry.example.com/notebook:2025b".to_string();

        // The only workspace uses a different kind entirely.
        let mut foreign = workspace("img-a", "pod-a");
        foreign.spec.kind = "other-kind".to_string();
        let usage = UsageCounts::from_workspaces("jupyterlab", &[foreign]);

        assert_eq!(workspace_kind::validate_update(&old, &new, &usage), Vec::new());
    }

    #[test]
    fn in_use_option_removal_is_rejected() {
        let old = base_kind();
        let mut new = base_kind();
        let mut replacement = new.spec.pod_template.options.image_config.values[0].clone();
        replacement.id = "img-b".to_string();
        new.spec.pod_template.options.image_config.values = vec![replacement];
        new.spec.pod_template.options.image_config.default = "img-b".to_string();

        let usage = UsageCounts::from_workspaces("jupyterlab", &[workspace("img-a", "pod-a")]);
        let errors = workspace_kind::validate_update(&old, &new, &usage);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].field,
            "spec.podTemplate.options.imageConfig.values[img-a]"
        );
        assert!(errors[0].message.contains("cannot be removed"));
    }

    #[test]
    fn referenced_kind_cannot_be_deleted() {
        let mut kind = base_kind();
        kind.status = Some(crate::crd::workspace_kind::WorkspaceKindStatus {
            workspaces: 2,
            ..Default::default()
        });

        let errors = workspace_kind::validate_delete(&kind);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot be deleted"));
    }

    #[test]
    fn finalizer_blocks_delete_even_without_status() {
        let mut kind = base_kind();
        kind.metadata.finalizers = Some(vec![KIND_PROTECTION_FINALIZER.to_string()]);

        let errors = workspace_kind::validate_delete(&kind);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("finalizer"));
    }

    #[test]
    fn workspace_with_unknown_option_is_rejected() {
        let kind = base_kind();
        let (errors, _) = workspace::validate_create(&workspace("img-gone", "pod-a"), Some(&kind));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.podTemplate.options.imageConfig");
    }

    #[test]
    fn workspace_kind_reference_is_immutable() {
        let kind = base_kind();
        let old = workspace("img-a", "pod-a");
        let mut new = old.clone();
        new.spec.kind = "another-kind".to_string();

        let (errors, _) = workspace::validate_update(&old, &new, Some(&kind));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.kind");
        assert!(errors[0].message.contains("immutable"));
    }

    #[test]
    fn selecting_a_redirected_option_surfaces_the_redirect_message() {
        let mut kind = base_kind();
        let mut replacement = kind.spec.pod_template.options.image_config.values[0].clone();
        replacement.id = "img-b".to_string();
        kind.spec.pod_template.options.image_config.values[0].redirect =
            Some(crate::crd::workspace_kind::OptionRedirect {
                to: "img-b".to_string(),
                message: Some("img-a is retired, img-b is its replacement".to_string()),
            });
        kind.spec.pod_template.options.image_config.values.push(replacement);

        let (errors, warnings) = workspace::validate_create(&workspace("img-a", "pod-a"), Some(&kind));
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("img-a is retired"));
    }

    #[test]
    fn deprecated_kind_returns_a_warning_not_an_error() {
        let mut kind = base_kind();
        kind.spec.spawner.deprecated = true;
        kind.spec.spawner.deprecation_message = Some("use jupyterlab-v2 instead".to_string());

        let (errors, warnings) = workspace::validate_create(&workspace("img-a", "pod-a"), Some(&kind));
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("use jupyterlab-v2 instead"));
    }
}
