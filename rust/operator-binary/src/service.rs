use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{Service, ServicePort, ServiceSpec},
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kube::{api::ObjectMeta, Resource, ResourceExt},
};

use crate::{
    crd::{
        child_generate_name, selector_labels, v1alpha1, HTTP_PORT_NAME_PREFIX,
        MAX_SERVICE_NAME_LEN,
    },
    options::ResolvedOptions,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    ObjectHasNoNamespace,

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef,
}

/// The ClusterIP service in front of a workspace pod, one port per port of
/// the currently reconciled image option.
pub fn build_workspace_service(
    workspace: &v1alpha1::Workspace,
    options: &ResolvedOptions<'_>,
) -> Result<Service, Error> {
    let namespace = workspace.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = workspace.name_any();

    Ok(Service {
        metadata: ObjectMeta {
            generate_name: Some(child_generate_name(&name, MAX_SERVICE_NAME_LEN)),
            namespace: Some(namespace),
            owner_references: Some(vec![workspace
                .controller_owner_ref(&())
                .context(ObjectMissingMetadataForOwnerRefSnafu)?]),
            labels: Some(selector_labels(&name)),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(&name)),
            ports: {
                let ports = service_ports(options);
                (!ports.is_empty()).then_some(ports)
            },
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

fn service_ports(options: &ResolvedOptions<'_>) -> Vec<ServicePort> {
    options
        .image
        .current
        .spec
        .ports
        .iter()
        .enumerate()
        .map(|(index, port)| ServicePort {
            name: Some(format!("{HTTP_PORT_NAME_PREFIX}{index}")),
            port: port.port,
            target_port: Some(IntOrString::Int(port.port)),
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crd::WORKSPACE_NAME_LABEL, options::resolve_workspace_options};

    fn fixtures() -> (v1alpha1::Workspace, v1alpha1::WorkspaceKind) {
        let workspace = r#"
        apiVersion: workspaces.dev/v1alpha1
        kind: Workspace
        metadata:
          name: my-workspace
          namespace: team-a
          uid: aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee
        spec:
          kind: jupyterlab
          podTemplate:
            volumes: {}
            options:
              imageConfig: img-a
              podConfig: pod-a
        "#;
        let kind = r#"
        apiVersion: workspaces.dev/v1alpha1
        kind: WorkspaceKind
        metadata:
          name: jupyterlab
          uid: 11111111-2222-3333-4444-555555555555
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
                        - id: vnc
                          displayName: Remote Desktop
                          port: 6080
              podConfig:
                default: pod-a
                values:
                  - id: pod-a
                    spawner:
                      displayName: Small CPU
                    spec: {}
        "#;
        (
            serde_yaml::from_str(workspace).expect("illegal test input"),
            serde_yaml::from_str(kind).expect("illegal test input"),
        )
    }

    #[test]
    fn service_exposes_each_image_port() {
        let (workspace, kind) = fixtures();
        let options = resolve_workspace_options(&workspace, &kind).unwrap();

        let service = build_workspace_service(&workspace, &options).unwrap();

        assert_eq!(
            service.metadata.generate_name.as_deref(),
            Some("ws-my-workspace-")
        );
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector
                .as_ref()
                .and_then(|selector| selector.get(WORKSPACE_NAME_LABEL))
                .map(String::as_str),
            Some("my-workspace")
        );

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name.as_deref(), Some("http-0"));
        assert_eq!(ports[0].port, 8888);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8888)));
        assert_eq!(ports[1].name.as_deref(), Some("http-1"));
        assert_eq!(ports[1].port, 6080);
    }
}
