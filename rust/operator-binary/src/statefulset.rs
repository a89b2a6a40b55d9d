//! Renders the single-replica workload backing a workspace.

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{StatefulSet, StatefulSetSpec},
            core::v1::{
                Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec,
                PodTemplateSpec, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::apis::meta::v1::LabelSelector,
    },
    kube::{api::ObjectMeta, Resource, ResourceExt},
    kvp::{AnnotationError, Annotations, LabelError, Labels},
};

use crate::{
    crd::{
        child_generate_name, selector_labels, v1alpha1, DATA_VOLUME_NAME_PREFIX, HOME_VOLUME_NAME,
        HTTP_PORT_NAME_PREFIX, MAIN_CONTAINER_NAME, MAX_STATEFULSET_NAME_LEN,
    },
    options::ResolvedOptions,
    template::{self, PathPrefixContext},
};

const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    ObjectHasNoNamespace,

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef,

    #[snafu(display("failed to build pod labels"))]
    BuildPodLabels { source: LabelError },

    #[snafu(display("failed to build pod annotations"))]
    BuildPodAnnotations { source: AnnotationError },

    #[snafu(display("failed to render environment variable {name:?}"))]
    RenderEnvVar {
        source: template::Error,
        name: String,
    },
}

/// The context `httpPathPrefix` resolves against during rendering: the port
/// ids of the currently reconciled image option.
pub fn path_prefix_context(
    workspace: &v1alpha1::Workspace,
    options: &ResolvedOptions<'_>,
) -> Result<PathPrefixContext, Error> {
    Ok(PathPrefixContext {
        namespace: workspace.namespace().context(ObjectHasNoNamespaceSnafu)?,
        workspace_name: workspace.name_any(),
        port_ids: options
            .image
            .current
            .spec
            .ports
            .iter()
            .map(|port| port.id.clone())
            .collect(),
    })
}

pub fn build_workspace_statefulset(
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
    options: &ResolvedOptions<'_>,
    service_name: &str,
) -> Result<StatefulSet, Error> {
    let namespace = workspace.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = workspace.name_any();
    let selector = selector_labels(&name);

    let pod_template = kind.spec.pod_template.clone();
    let image_spec = &options.image.current.spec;
    let pod_spec_option = &options.pod.current.spec;

    let replicas = if workspace.spec.paused { 0 } else { 1 };

    Ok(StatefulSet {
        metadata: ObjectMeta {
            generate_name: Some(child_generate_name(&name, MAX_STATEFULSET_NAME_LEN)),
            namespace: Some(namespace),
            owner_references: Some(vec![workspace
                .controller_owner_ref(&())
                .context(ObjectMissingMetadataForOwnerRefSnafu)?]),
            labels: Some(selector.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..LabelSelector::default()
            },
            service_name: Some(service_name.to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(workspace, kind)?),
                    annotations: non_empty(pod_annotations(workspace, kind)?),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: MAIN_CONTAINER_NAME.to_string(),
                        image: Some(image_spec.image.clone()),
                        image_pull_policy: Some(
                            image_spec
                                .image_pull_policy
                                .clone()
                                .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string()),
                        ),
                        ports: non_empty_vec(container_ports(options)),
                        env: non_empty_vec(rendered_env(workspace, kind, options)?),
                        volume_mounts: non_empty_vec(volume_mounts(workspace, kind)),
                        resources: pod_spec_option.resources.clone(),
                        security_context: pod_template.container_security_context.clone(),
                        startup_probe: pod_template
                            .probes
                            .as_ref()
                            .and_then(|probes| probes.startup_probe.clone()),
                        liveness_probe: pod_template
                            .probes
                            .as_ref()
                            .and_then(|probes| probes.liveness_probe.clone()),
                        readiness_probe: pod_template
                            .probes
                            .as_ref()
                            .and_then(|probes| probes.readiness_probe.clone()),
                        ..Container::default()
                    }],
                    volumes: non_empty_vec(volumes(workspace)),
                    service_account_name: Some(pod_template.service_account.name.clone()),
                    security_context: pod_template.security_context.clone(),
                    affinity: pod_spec_option.affinity.clone(),
                    node_selector: pod_spec_option.node_selector.clone(),
                    tolerations: pod_spec_option.tolerations.clone(),
                    ..PodSpec::default()
                }),
            },
            ..StatefulSetSpec::default()
        }),
        status: None,
    })
}

/// Kind-supplied pod labels first, workspace-supplied ones on top, selector
/// labels last so they can never be overridden.
fn pod_labels(
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
) -> Result<BTreeMap<String, String>, Error> {
    let mut labels = BTreeMap::new();
    if let Some(pod_metadata) = &kind.spec.pod_template.pod_metadata {
        labels.extend(pod_metadata.labels.clone());
    }
    if let Some(pod_metadata) = &workspace.spec.pod_template.pod_metadata {
        labels.extend(pod_metadata.labels.clone());
    }
    labels.extend(selector_labels(&workspace.name_any()));

    Ok(Labels::try_from(labels).context(BuildPodLabelsSnafu)?.into())
}

fn pod_annotations(
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
) -> Result<BTreeMap<String, String>, Error> {
    let mut annotations = BTreeMap::new();
    if let Some(pod_metadata) = &kind.spec.pod_template.pod_metadata {
        annotations.extend(pod_metadata.annotations.clone());
    }
    if let Some(pod_metadata) = &workspace.spec.pod_template.pod_metadata {
        annotations.extend(pod_metadata.annotations.clone());
    }

    Ok(Annotations::try_from(annotations)
        .context(BuildPodAnnotationsSnafu)?
        .into())
}

/// Empty maps and lists are left out of the rendered spec entirely; the
/// apiserver drops them on round-trip, which would otherwise read as
/// permanent drift in the child diff.
fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then_some(map)
}

fn non_empty_vec<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

fn container_ports(options: &ResolvedOptions<'_>) -> Vec<ContainerPort> {
    options
        .image
        .current
        .spec
        .ports
        .iter()
        .enumerate()
        .map(|(index, port)| ContainerPort {
            name: Some(format!("{HTTP_PORT_NAME_PREFIX}{index}")),
            container_port: port.port,
            protocol: Some(port.protocol.clone()),
            ..ContainerPort::default()
        })
        .collect()
}

fn rendered_env(
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
    options: &ResolvedOptions<'_>,
) -> Result<Vec<EnvVar>, Error> {
    let ctx = path_prefix_context(workspace, options)?;
    kind.spec
        .pod_template
        .extra_env
        .iter()
        .map(|env| {
            let value = template::render(&env.value, &ctx).context(RenderEnvVarSnafu {
                name: env.name.clone(),
            })?;
            Ok(EnvVar {
                name: env.name.clone(),
                value: Some(value),
                value_from: None,
            })
        })
        .collect()
}

fn volume_mounts(
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
) -> Vec<VolumeMount> {
    let volumes = &workspace.spec.pod_template.volumes;
    let mut mounts = Vec::new();

    if volumes.home.is_some() {
        mounts.push(VolumeMount {
            name: HOME_VOLUME_NAME.to_string(),
            mount_path: kind.spec.pod_template.volume_mounts.home.clone(),
            ..VolumeMount::default()
        });
    }
    for (index, data) in volumes.data.iter().enumerate() {
        mounts.push(VolumeMount {
            name: format!("{DATA_VOLUME_NAME_PREFIX}{index}"),
            mount_path: data.mount_path.clone(),
            read_only: Some(data.read_only),
            ..VolumeMount::default()
        });
    }

    mounts
}

fn volumes(workspace: &v1alpha1::Workspace) -> Vec<Volume> {
    let declared = &workspace.spec.pod_template.volumes;
    let mut volumes = Vec::new();

    if let Some(home) = &declared.home {
        volumes.push(Volume {
            name: HOME_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: home.clone(),
                read_only: None,
            }),
            ..Volume::default()
        });
    }
    for (index, data) in declared.data.iter().enumerate() {
        volumes.push(Volume {
            name: format!("{DATA_VOLUME_NAME_PREFIX}{index}"),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: data.pvc_name.clone(),
                read_only: Some(data.read_only),
            }),
            ..Volume::default()
        });
    }

    volumes
}
