//! Renders the Istio VirtualService that exposes a workspace under
//! `/workspace/<namespace>/<name>/<portId>/`. Only built when the operator
//! runs with an ingress gateway configured.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::kube::{api::ObjectMeta, CustomResource, Resource, ResourceExt};

use crate::{
    crd::{child_generate_name, selector_labels, v1alpha1, MAX_SERVICE_NAME_LEN},
    options::ResolvedOptions,
    statefulset::path_prefix_context,
    template,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    ObjectHasNoNamespace,

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef,

    #[snafu(display("failed to build template context"))]
    BuildTemplateContext { source: crate::statefulset::Error },

    #[snafu(display("failed to render request header {name:?}"))]
    RenderRequestHeader {
        source: template::Error,
        name: String,
    },
}

/// The slice of the Istio `VirtualService` schema this operator writes.
/// Modeled here instead of pulling in a full Istio client crate.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "VirtualService",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServiceSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRoute>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<HttpMatchRequest>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<HttpRouteDestination>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<HttpRewrite>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRewrite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteDestination {
    pub destination: Destination,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSelector {
    pub number: u32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOperations>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderOperations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

pub fn build_workspace_virtual_service(
    workspace: &v1alpha1::Workspace,
    kind: &v1alpha1::WorkspaceKind,
    options: &ResolvedOptions<'_>,
    service_name: &str,
    gateway: &str,
) -> Result<VirtualService, Error> {
    let namespace = workspace.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = workspace.name_any();
    let ctx = path_prefix_context(workspace, options).context(BuildTemplateContextSnafu)?;

    let http_proxy = kind.spec.pod_template.http_proxy.clone().unwrap_or_default();
    let headers = match &http_proxy.request_headers {
        Some(rules) => Some(Headers {
            request: Some(HeaderOperations {
                set: render_header_values(&rules.set, &ctx)?,
                add: render_header_values(&rules.add, &ctx)?,
                remove: rules.remove.clone(),
            }),
        }),
        None => None,
    };

    let service_host = format!("{service_name}.{namespace}.svc.cluster.local");
    let http = options
        .image
        .current
        .spec
        .ports
        .iter()
        .map(|port| HttpRoute {
            match_: vec![HttpMatchRequest {
                uri: Some(StringMatch {
                    prefix: Some(ctx.http_path_prefix(&port.id)),
                }),
            }],
            route: vec![HttpRouteDestination {
                destination: Destination {
                    host: service_host.clone(),
                    port: Some(PortSelector {
                        number: port.port as u32,
                    }),
                },
            }],
            rewrite: http_proxy.remove_path_prefix.then(|| HttpRewrite {
                uri: Some("/".to_string()),
            }),
            headers: headers.clone(),
        })
        .collect();

    Ok(VirtualService {
        metadata: ObjectMeta {
            generate_name: Some(child_generate_name(&name, MAX_SERVICE_NAME_LEN)),
            namespace: Some(namespace),
            owner_references: Some(vec![workspace
                .controller_owner_ref(&())
                .context(ObjectMissingMetadataForOwnerRefSnafu)?]),
            labels: Some(selector_labels(&name)),
            ..ObjectMeta::default()
        },
        spec: VirtualServiceSpec {
            hosts: vec!["*".to_string()],
            gateways: vec![gateway.to_string()],
            http,
        },
    })
}

fn render_header_values(
    headers: &BTreeMap<String, String>,
    ctx: &template::PathPrefixContext,
) -> Result<BTreeMap<String, String>, Error> {
    headers
        .iter()
        .map(|(name, value)| {
            let rendered = template::render(value, ctx).context(RenderRequestHeaderSnafu {
                name: name.clone(),
            })?;
            Ok((name.clone(), rendered))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::resolve_workspace_options;

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
            httpProxy:
              removePathPrefix: true
              requestHeaders:
                set:
                  X-RStudio-Root-Path: '{{ httpPathPrefix(portId="rstudio") }}'
                remove:
                  - X-Forwarded-Proto
            options:
              imageConfig:
                default: img-a
                values:
                  - id: img-a
                    spawner:
                      displayName: RStudio 2025a
                    spec:
                      image: registry.example.com/rstudio:2025a
                      ports:
                        - id: rstudio
                          displayName: RStudio
                          port: 8787
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
    fn routes_are_built_per_port_with_rewrite_and_headers() {
        let (workspace, kind) = fixtures();
        let options = resolve_workspace_options(&workspace, &kind).unwrap();

        let vs = build_workspace_virtual_service(
            &workspace,
            &kind,
            &options,
            "ws-my-workspace-abcde",
            "workspaces/workspaces-gateway",
        )
        .unwrap();

        assert_eq!(vs.spec.gateways, vec!["workspaces/workspaces-gateway"]);
        assert_eq!(vs.spec.http.len(), 1);

        let route = &vs.spec.http[0];
        assert_eq!(
            route.match_[0].uri.as_ref().unwrap().prefix.as_deref(),
            Some("/workspace/team-a/my-workspace/rstudio/")
        );
        assert_eq!(
            route.route[0].destination.host,
            "ws-my-workspace-abcde.team-a.svc.cluster.local"
        );
        assert_eq!(route.route[0].destination.port, Some(PortSelector { number: 8787 }));
        assert_eq!(
            route.rewrite,
            Some(HttpRewrite {
                uri: Some("/".to_string())
            })
        );

        let request = route.headers.as_ref().unwrap().request.as_ref().unwrap();
        assert_eq!(
            request.set.get("X-RStudio-Root-Path").map(String::as_str),
            Some("/workspace/team-a/my-workspace/rstudio/")
        );
        assert_eq!(request.remove, vec!["X-Forwarded-Proto"]);
    }
}
