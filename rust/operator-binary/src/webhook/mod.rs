//! Serves the validating admission webhooks for both custom resources over
//! TLS. The handlers are thin: they unwrap the review, call the pure
//! validators and translate field errors into a denial.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{extract::State, routing::post, Json, Router};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::{
    self,
    api::{Api, ListParams},
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
        DynamicObject,
    },
    ResourceExt,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::{
    crd::v1alpha1,
    validation::{self, format_errors, UsageCounts},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read certificate chain from {path:?}"))]
    ReadCertificateChain {
        source: rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read private key from {path:?}"))]
    ReadPrivateKey {
        source: rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to build TLS server configuration"))]
    BuildTlsConfig { source: rustls::Error },

    #[snafu(display("failed to bind webhook listener to {address}"))]
    BindListener {
        source: std::io::Error,
        address: SocketAddr,
    },
}

pub struct WebhookServerOptions {
    pub bind_address: SocketAddr,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
}

#[derive(Clone)]
struct AppState {
    client: kube::Client,
}

pub async fn run(client: kube::Client, options: WebhookServerOptions) -> Result<(), Error> {
    let router = Router::new()
        .route("/validate/workspacekinds", post(validate_workspace_kind))
        .route("/validate/workspaces", post(validate_workspace))
        .with_state(AppState { client });

    let tls_config = load_tls_config(&options.tls_cert_file, &options.tls_key_file)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(options.bind_address)
        .await
        .context(BindListenerSnafu {
            address: options.bind_address,
        })?;
    tracing::info!(address = %options.bind_address, "admission webhook listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept webhook connection");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(%peer, error = %err, "webhook connection closed with an error");
            }
        });
    }
}

fn load_tls_config(cert_file: &Path, key_file: &Path) -> Result<rustls::ServerConfig, Error> {
    let certs = CertificateDer::pem_file_iter(cert_file)
        .context(ReadCertificateChainSnafu { path: cert_file })?
        .collect::<Result<Vec<_>, _>>()
        .context(ReadCertificateChainSnafu { path: cert_file })?;
    let key =
        PrivateKeyDer::from_pem_file(key_file).context(ReadPrivateKeySnafu { path: key_file })?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context(BuildTlsConfigSnafu)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

async fn validate_workspace_kind(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview<v1alpha1::WorkspaceKind>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<v1alpha1::WorkspaceKind> = match review.try_into() {
        Ok(request) => request,
        Err(err) => return Json(AdmissionResponse::invalid(err.to_string()).into_review()),
    };

    let errors = match request.operation {
        Operation::Create => match &request.object {
            Some(kind) => validation::workspace_kind::validate_create(kind),
            None => return Json(invalid(&request, "no object in create request")),
        },
        Operation::Update => {
            let (Some(old), Some(new)) = (&request.old_object, &request.object) else {
                return Json(invalid(&request, "update request is missing objects"));
            };
            let usage = match workspace_kind_usage(&state, old).await {
                Ok(usage) => usage,
                Err(err) => {
                    return Json(invalid(
                        &request,
                        &format!("failed to determine option usage: {err}"),
                    ));
                }
            };
            validation::workspace_kind::validate_update(old, new, &usage)
        }
        Operation::Delete => match &request.old_object {
            Some(kind) => validation::workspace_kind::validate_delete(kind),
            None => return Json(invalid(&request, "no object in delete request")),
        },
        Operation::Connect => Vec::new(),
    };

    let mut response = AdmissionResponse::from(&request);
    if !errors.is_empty() {
        response = response.deny(format_errors(&errors));
    }
    Json(response.into_review())
}

async fn validate_workspace(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview<v1alpha1::Workspace>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<v1alpha1::Workspace> = match review.try_into() {
        Ok(request) => request,
        Err(err) => return Json(AdmissionResponse::invalid(err.to_string()).into_review()),
    };

    let (errors, warnings) = match request.operation {
        Operation::Create => {
            let Some(workspace) = &request.object else {
                return Json(invalid(&request, "no object in create request"));
            };
            let kind = match fetch_kind(&state, &workspace.spec.kind).await {
                Ok(kind) => kind,
                Err(err) => {
                    return Json(invalid(
                        &request,
                        &format!("failed to look up WorkspaceKind: {err}"),
                    ));
                }
            };
            validation::workspace::validate_create(workspace, kind.as_ref())
        }
        Operation::Update => {
            let (Some(old), Some(new)) = (&request.old_object, &request.object) else {
                return Json(invalid(&request, "update request is missing objects"));
            };
            let kind = match fetch_kind(&state, &new.spec.kind).await {
                Ok(kind) => kind,
                Err(err) => {
                    return Json(invalid(
                        &request,
                        &format!("failed to look up WorkspaceKind: {err}"),
                    ));
                }
            };
            validation::workspace::validate_update(old, new, kind.as_ref())
        }
        Operation::Delete | Operation::Connect => (Vec::new(), Vec::new()),
    };

    let mut response = AdmissionResponse::from(&request);
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    if !errors.is_empty() {
        response = response.deny(format_errors(&errors));
    }
    Json(response.into_review())
}

/// Usage from the kind status when populated, otherwise counted from a live
/// listing of the referencing workspaces.
async fn workspace_kind_usage(
    state: &AppState,
    kind: &v1alpha1::WorkspaceKind,
) -> Result<UsageCounts, kube::Error> {
    if let Some(usage) = UsageCounts::from_status(kind) {
        return Ok(usage);
    }

    let workspaces = Api::<v1alpha1::Workspace>::all(state.client.clone())
        .list(&ListParams::default())
        .await?;
    Ok(UsageCounts::from_workspaces(
        &kind.name_any(),
        &workspaces.items,
    ))
}

async fn fetch_kind(
    state: &AppState,
    name: &str,
) -> Result<Option<v1alpha1::WorkspaceKind>, kube::Error> {
    Api::<v1alpha1::WorkspaceKind>::all(state.client.clone())
        .get_opt(name)
        .await
}

fn invalid<T>(request: &AdmissionRequest<T>, reason: &str) -> AdmissionReview<DynamicObject>
where
    T: stackable_operator::kube::Resource<DynamicType = ()>,
{
    let mut response = AdmissionResponse::from(request);
    response = response.deny(reason);
    response.into_review()
}
