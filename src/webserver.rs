//! Certificate server
//!
//! Each certificate request runs through the same pipeline:
//!
//! ```text
//! method check -> parse body -> scan + resolve -> freshness -> allow-list -> package
//! ```
//!
//! and may stop at any step with its own status. Freshness is decided before the
//! allow-list is consulted, so an up-to-date requester gets `304` whatever its key.
//! Directories are rescanned on every request; the only shared state is the
//! read-only configuration.

use crate::authorization::is_authorized;
use crate::configs::ServerConfig;
use crate::packager::package;
use crate::protocol::{
    deserialize_request, CERTIFICATE_REQUEST_ENDPOINT, ENCRYPTED_CONTENT_TYPE, HEALTH_ENDPOINT,
};
use crate::resolver::resolve;
use crate::store::scan_directories;
use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

/// Read-only state shared by all request handlers
#[derive(Debug, Clone)]
pub struct CertificateServer {
    certificate_directories: Vec<PathBuf>,
    allowed_keys: Vec<String>,
}

/// Terminal state of a certificate request
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Encrypted archive for the requester
    Certificate(Vec<u8>),
    NotModified,
    BadRequest,
    NotFound,
    Forbidden,
    InternalError,
}

impl Reply {
    pub fn status(&self) -> StatusCode {
        match self {
            Reply::Certificate(_) => StatusCode::OK,
            Reply::NotModified => StatusCode::NOT_MODIFIED,
            Reply::BadRequest => StatusCode::BAD_REQUEST,
            Reply::NotFound => StatusCode::NOT_FOUND,
            Reply::Forbidden => StatusCode::FORBIDDEN,
            Reply::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Reply::Certificate(body) => {
                (status, [(header::CONTENT_TYPE, ENCRYPTED_CONTENT_TYPE)], body).into_response()
            }
            Reply::NotModified => status.into_response(),
            Reply::BadRequest => (status, "Invalid request body").into_response(),
            Reply::NotFound => (status, "Certificate not found").into_response(),
            Reply::Forbidden => (status, "Public key not authorized").into_response(),
            Reply::InternalError => (status, "Internal server error").into_response(),
        }
    }
}

impl CertificateServer {
    pub fn new(certificate_directories: Vec<PathBuf>, allowed_keys: Vec<String>) -> Self {
        Self {
            certificate_directories,
            allowed_keys,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.server.certificate_directories.clone(),
            config.public_keys.clone(),
        )
    }

    /// Run the request pipeline on a POSTed body. Blocking: reads the
    /// certificate directories from disk.
    pub fn process_request(&self, body: &[u8]) -> Reply {
        let request = match deserialize_request(body) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to unmarshal request body");
                return Reply::BadRequest;
            }
        };

        info!(
            domain = %request.domain,
            public_key = %request.public_key,
            expiration = ?request.expiration,
            "Received certificate request"
        );

        let indices = scan_directories(&self.certificate_directories);
        let found = resolve(&indices, &request.domain);
        if found.is_empty() {
            info!(domain = %request.domain, "Certificate not found for domain");
            return Reply::NotFound;
        }

        if let Some(known) = request.expiration {
            // First file of the match stands in for the set; with certbot's
            // layout that is cert.pem
            let is_newer = matches!(found[0].expiration, Some(current) if current > known);
            if !is_newer {
                info!(domain = %request.domain, "Client certificate is up to date. No action needed.");
                return Reply::NotModified;
            }
        }

        if !is_authorized(&request.public_key, &self.allowed_keys) {
            warn!(public_key = %request.public_key, "Public key not whitelisted");
            return Reply::Forbidden;
        }

        info!(domain = %request.domain, files = found.len(), "Sending certificate");
        match package(&found, &request.public_key) {
            Ok(sealed) => Reply::Certificate(sealed),
            Err(e) => {
                error!(error = %e, "Failed to encrypt certificates");
                Reply::InternalError
            }
        }
    }
}

/// Routes for the certificate and health endpoints. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(server: Arc<CertificateServer>) -> Router {
    Router::new()
        .route(CERTIFICATE_REQUEST_ENDPOINT, any(handle_certificate_request))
        .route(HEALTH_ENDPOINT, any(handle_health))
        .with_state(server)
}

async fn handle_certificate_request(
    State(server): State<Arc<CertificateServer>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    body: Bytes,
) -> Response {
    let span = info_span!("certificate_request", request_id = %request_id());
    span.in_scope(|| info!(remote_addr = %remote_addr, "Received request from IP"));

    if method != Method::POST {
        span.in_scope(|| warn!(method = %method, "Only POST method is allowed"));
        return (StatusCode::METHOD_NOT_ALLOWED, "Only POST method is allowed").into_response();
    }

    let task_span = span.clone();
    let reply = tokio::task::spawn_blocking(move || {
        task_span.in_scope(|| server.process_request(&body))
    })
    .await
    .unwrap_or_else(|e| {
        span.in_scope(|| error!(error = %e, "Certificate request task failed"));
        Reply::InternalError
    });

    reply.into_response()
}

async fn handle_health() -> &'static str {
    "OK"
}

/// Random 32-bit request id, hex encoded
fn request_id() -> String {
    let mut id = [0u8; 4];
    match openssl::rand::rand_bytes(&mut id) {
        Ok(()) => format!("{:08x}", u32::from_be_bytes(id)),
        Err(_) => "00000000".to_string(),
    }
}

/// Serve until the listener fails. Plain HTTP unless TLS files are configured.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let details = &config.server;
    let addr = tokio::net::lookup_host((details.listen_address.as_str(), details.port))
        .await
        .with_context(|| format!("Failed to resolve listen address {}", details.listen_address))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {}", details.listen_address))?;

    let app = router(Arc::new(CertificateServer::from_config(&config)))
        .into_make_service_with_connect_info::<SocketAddr>();

    match (&details.tls_certificate, &details.tls_private_key) {
        (Some(certificate), Some(private_key)) => {
            let tls = RustlsConfig::from_pem_file(certificate, private_key)
                .await
                .context("Failed to load TLS certificate and key")?;
            info!(address = %addr, "Starting HTTPS server");
            axum_server::bind_rustls(addr, tls)
                .serve(app)
                .await
                .context("Server failed")?;
        }
        _ => {
            info!(address = %addr, "Starting server");
            axum_server::bind(addr)
                .serve(app)
                .await
                .context("Server failed")?;
        }
    }
    Ok(())
}

/// Blocking entry point: validates the configuration and serves on a fresh
/// multi-threaded runtime.
pub fn start_webserver(mut config: ServerConfig) -> Result<()> {
    config
        .validate()
        .context("Server configuration validation failed")?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(serve(config))
}
