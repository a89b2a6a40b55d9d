// Most error enums in this crate are snafu enums carrying kube errors, which
// are large by themselves.
#![allow(clippy::result_large_err)]

mod controller;
mod crd;
mod culling;
mod kind_controller;
mod options;
mod service;
mod state;
mod statefulset;
mod store;
mod template;
mod validation;
mod virtual_service;
mod webhook;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use futures::stream::StreamExt;
use stackable_operator::{
    cli::Command,
    k8s_openapi::api::{
        apps::v1::StatefulSet,
        core::v1::{Pod, Service},
    },
    kube::{
        api::Api,
        core::DeserializeGuard,
        runtime::{
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher, Controller,
        },
        ResourceExt,
    },
    logging::controller::report_controller_reconciled,
    shared::yaml::SerializeOptions,
    telemetry::{tracing::TelemetryOptions, Tracing},
    utils::cluster_info::KubernetesClusterInfoOptions,
    YamlSchema,
};

use crate::{
    crd::{
        v1alpha1, Workspace, WorkspaceKind, WorkspaceKindVersion, WorkspaceVersion,
        WORKSPACE_NAME_LABEL,
    },
    virtual_service::VirtualService,
    webhook::WebhookServerOptions,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const OPERATOR_NAME: &str = "workspaces.dev";

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<WorkspacesOperatorRun>,
}

#[derive(clap::Parser)]
struct WorkspacesOperatorRun {
    #[command(flatten)]
    telemetry: TelemetryOptions,

    #[command(flatten)]
    cluster_info: KubernetesClusterInfoOptions,

    /// Address the validating admission webhook listens on.
    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:8443")]
    webhook_bind_address: SocketAddr,

    /// PEM certificate chain presented by the admission webhook.
    #[arg(long, env = "WEBHOOK_TLS_CERT_FILE")]
    webhook_tls_cert_file: PathBuf,

    /// PEM private key belonging to the webhook certificate.
    #[arg(long, env = "WEBHOOK_TLS_KEY_FILE")]
    webhook_tls_key_file: PathBuf,

    /// Istio gateway (`<namespace>/<name>`) fronting workspace traffic.
    /// VirtualServices are only rendered when this is set.
    #[arg(long, env = "ISTIO_GATEWAY")]
    istio_gateway: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            Workspace::merged_crd(WorkspaceVersion::V1Alpha1)?
                .print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?;
            WorkspaceKind::merged_crd(WorkspaceKindVersion::V1Alpha1)?
                .print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?;
        }
        Command::Run(WorkspacesOperatorRun {
            telemetry,
            cluster_info,
            webhook_bind_address,
            webhook_tls_cert_file,
            webhook_tls_key_file,
            istio_gateway,
        }) => {
            let _tracing_guard = Tracing::pre_configured(built_info::PKG_NAME, telemetry).init()?;

            // Several dependencies compile rustls with different provider
            // features; the process-wide default has to be picked before any
            // TLS configuration is built.
            if rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .is_err()
            {
                tracing::warn!("default TLS crypto provider was already installed");
            }

            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &cluster_info,
            )
            .await?;

            tokio::spawn({
                let kube = client.as_kube_client();
                let options = WebhookServerOptions {
                    bind_address: webhook_bind_address,
                    tls_cert_file: webhook_tls_cert_file,
                    tls_key_file: webhook_tls_key_file,
                };
                async move {
                    if let Err(err) = webhook::run(kube, options).await {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            "admission webhook server failed"
                        );
                    }
                }
            });

            let workspace_events = Arc::new(Recorder::new(
                client.as_kube_client(),
                Reporter {
                    controller: controller::FULL_CONTROLLER_NAME.to_string(),
                    instance: None,
                },
            ));
            let workspace_controller = Controller::new(
                Api::<DeserializeGuard<v1alpha1::Workspace>>::all(client.as_kube_client()),
                watcher::Config::default(),
            );
            let workspace_store = workspace_controller.store();
            let workspace_controller = {
                let controller = workspace_controller
                    .owns(
                        Api::<StatefulSet>::all(client.as_kube_client()),
                        watcher::Config::default(),
                    )
                    .owns(
                        Api::<Service>::all(client.as_kube_client()),
                        watcher::Config::default(),
                    );
                let controller = if istio_gateway.is_some() {
                    controller.owns(
                        Api::<VirtualService>::all(client.as_kube_client()),
                        watcher::Config::default(),
                    )
                } else {
                    controller
                };
                controller
                    .shutdown_on_signal()
                    .watches(
                        Api::<DeserializeGuard<v1alpha1::WorkspaceKind>>::all(
                            client.as_kube_client(),
                        ),
                        watcher::Config::default(),
                        move |kind| {
                            workspace_store
                                .state()
                                .into_iter()
                                .filter(move |workspace| references_kind(workspace, &kind))
                                .map(|workspace| ObjectRef::from_obj(&*workspace))
                        },
                    )
                    .watches(
                        Api::<Pod>::all(client.as_kube_client()),
                        watcher::Config::default().labels(WORKSPACE_NAME_LABEL),
                        workspace_ref_for_pod,
                    )
                    .run(
                        controller::reconcile_workspace,
                        controller::error_policy,
                        Arc::new(controller::Ctx {
                            client: client.clone(),
                            istio_gateway,
                        }),
                    )
                    .for_each_concurrent(16, move |result| {
                        let events = workspace_events.clone();
                        async move {
                            report_controller_reconciled(
                                &events,
                                controller::FULL_CONTROLLER_NAME,
                                &result,
                            )
                            .await;
                        }
                    })
            };

            let culling_events = Arc::new(Recorder::new(
                client.as_kube_client(),
                Reporter {
                    controller: culling::FULL_CONTROLLER_NAME.to_string(),
                    instance: None,
                },
            ));
            let culling_controller = Controller::new(
                Api::<DeserializeGuard<v1alpha1::Workspace>>::all(client.as_kube_client()),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .run(
                culling::reconcile_culling,
                culling::error_policy,
                Arc::new(culling::Ctx {
                    client: client.clone(),
                    http: reqwest::Client::builder()
                        .timeout(culling::probe::PROBE_TIMEOUT)
                        .build()?,
                }),
            )
            .for_each_concurrent(16, move |result| {
                let events = culling_events.clone();
                async move {
                    report_controller_reconciled(&events, culling::FULL_CONTROLLER_NAME, &result)
                        .await;
                }
            });

            let kind_events = Arc::new(Recorder::new(
                client.as_kube_client(),
                Reporter {
                    controller: kind_controller::FULL_CONTROLLER_NAME.to_string(),
                    instance: None,
                },
            ));
            let kind_controller = Controller::new(
                Api::<DeserializeGuard<v1alpha1::WorkspaceKind>>::all(client.as_kube_client()),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .watches(
                Api::<DeserializeGuard<v1alpha1::Workspace>>::all(client.as_kube_client()),
                watcher::Config::default(),
                |workspace| {
                    let kind_name = workspace
                        .0
                        .as_ref()
                        .ok()
                        .map(|workspace| workspace.spec.kind.clone())?;
                    Some(ObjectRef::<DeserializeGuard<v1alpha1::WorkspaceKind>>::new(
                        &kind_name,
                    ))
                },
            )
            .run(
                kind_controller::reconcile_workspace_kind,
                kind_controller::error_policy,
                Arc::new(kind_controller::Ctx {
                    client: client.clone(),
                }),
            )
            .for_each_concurrent(16, move |result| {
                let events = kind_events.clone();
                async move {
                    report_controller_reconciled(
                        &events,
                        kind_controller::FULL_CONTROLLER_NAME,
                        &result,
                    )
                    .await;
                }
            });

            futures::join!(workspace_controller, culling_controller, kind_controller);
        }
    }

    Ok(())
}

fn references_kind(
    workspace: &DeserializeGuard<v1alpha1::Workspace>,
    kind: &DeserializeGuard<v1alpha1::WorkspaceKind>,
) -> bool {
    let Ok(workspace) = &workspace.0 else {
        return false;
    };
    let Ok(kind) = &kind.0 else {
        return false;
    };

    workspace.spec.kind == kind.name_any()
}

/// Pods carry the owning workspace's name as a label; route their events to
/// the matching reconcile key.
fn workspace_ref_for_pod(pod: Pod) -> Option<ObjectRef<DeserializeGuard<v1alpha1::Workspace>>> {
    let namespace = pod.namespace()?;
    let workspace_name = pod.labels().get(WORKSPACE_NAME_LABEL)?;
    Some(ObjectRef::new(workspace_name).within(&namespace))
}
