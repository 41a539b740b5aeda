//! Certificate client
//!
//! Polls the server for each configured domain, installs new certificate sets
//! and runs their renew commands.

use crate::configs::{CertificateConfig, ClientConfig};
use crate::encryption::Identity;
use crate::hooks::run_commands;
use crate::packager::unpack;
use crate::protocol::{serialize_request, CertificateRequest, CERTIFICATE_REQUEST_ENDPOINT};
use crate::resolver::resolve;
use crate::store::scan_directory;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SECONDS_PER_HOUR: u64 = 60 * 60;

/// Result of one request for one domain
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The server had nothing newer than what is installed
    UpToDate,
    /// Files written into the destination directory
    Installed(Vec<PathBuf>),
}

pub struct CertificateClient {
    http: reqwest::Client,
    endpoint: String,
    identity: Identity,
    public_key: String,
}

impl CertificateClient {
    /// Build a client from a validated configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let identity: Identity = config
            .key
            .private_key
            .parse()
            .context("invalid key.private_key")?;
        let public_key = match &config.key.public_key {
            Some(public_key) => public_key.clone(),
            None => identity.to_recipient()?.to_string(),
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!("{}{}", config.connection.server, CERTIFICATE_REQUEST_ENDPOINT),
            identity,
            public_key,
        })
    }

    /// Request one domain and install the result.
    ///
    /// The expiration sent along is read from whatever the destination
    /// directory already holds for the domain. Renew commands only run after a
    /// new set was written.
    pub async fn process_certificate(&self, certificate: &CertificateConfig) -> Result<Outcome> {
        let expiration = installed_expiration(&certificate.directory, &certificate.domain);

        let request = CertificateRequest {
            domain: certificate.domain.clone(),
            public_key: self.public_key.clone(),
            expiration,
        };
        debug!(url = %self.endpoint, "Sending request to server");
        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(serialize_request(&request)?)
            .send()
            .await
            .context("Failed to send certificate request")?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            info!(domain = %certificate.domain, "Certificate is up-to-date");
            return Ok(Outcome::UpToDate);
        }
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            bail!("Failed to get certificate with status {}: {}", status, body.trim_end());
        }

        let sealed = response
            .bytes()
            .await
            .context("Failed to read response body")?;
        let archive = self
            .identity
            .decrypt(&sealed)
            .context("Failed to decrypt data")?;
        let written = unpack(&archive, &certificate.directory)
            .context("Failed to unpack certificate archive")?;
        info!(
            directory = %certificate.directory.display(),
            domain = %certificate.domain,
            files = written.len(),
            "Successfully downloaded and extracted certificates"
        );

        run_commands(&certificate.renew_commands)
            .await
            .context("Failed to execute one or more renew commands")?;
        Ok(Outcome::Installed(written))
    }

    /// Process every certificate once. A failing domain is logged and does not
    /// stop the others.
    pub async fn run_once(&self, certificates: &[CertificateConfig]) {
        for certificate in certificates {
            info!(
                server = %self.endpoint,
                domain = %certificate.domain,
                "Requesting certificate from server"
            );
            if let Err(e) = self.process_certificate(certificate).await {
                error!(
                    domain = %certificate.domain,
                    error = %format!("{:#}", e),
                    "Failed to process certificate request"
                );
            }
        }
    }

    /// Process every certificate, then sleep `interval_hours` and repeat.
    /// Returns after a single pass when no interval is set.
    pub async fn run(&self, certificates: &[CertificateConfig], interval_hours: Option<u64>) {
        loop {
            self.run_once(certificates).await;

            let hours = match interval_hours {
                Some(hours) if hours > 0 => hours,
                _ => {
                    info!("Interval not configured, exiting after single execution");
                    return;
                }
            };
            info!(hours, "Waiting until next execution");
            tokio::time::sleep(polling_interval(hours)).await;
        }
    }
}

fn polling_interval(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(SECONDS_PER_HOUR))
}

/// Expiration of the installed certificate for `domain`, if the directory holds one.
fn installed_expiration(directory: &Path, domain: &str) -> Option<DateTime<Utc>> {
    if !directory.exists() {
        return None;
    }
    info!(directory = %directory.display(), "Checking existing certificates");
    let index = match scan_directory(directory) {
        Ok(index) => index,
        Err(e) => {
            error!(directory = %directory.display(), error = %e, "Failed to read certificate directory");
            return None;
        }
    };
    let indices = [index];
    let expiration = resolve(&indices, domain).first()?.expiration;
    if let Some(expiration) = expiration {
        info!(expiration = %expiration, "Found existing certificate expiration date");
    }
    expiration
}

/// Blocking entry point: validates the configuration and polls on a fresh
/// multi-threaded runtime.
pub fn start_client(mut config: ClientConfig) -> Result<()> {
    config
        .validate()
        .context("Client configuration validation failed")?;
    let client = CertificateClient::new(&config)?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(client.run(&config.certificate, config.interval_hours));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{ConnectionConfig, KeyConfig};
    use crate::test_support::{spawn_server, TestCertificate};
    use crate::webserver::CertificateServer;
    use chrono::Duration as ChronoDuration;
    use std::fs;
    use tempfile::TempDir;

    struct Setup {
        source: TempDir,
        destination: TempDir,
        config: ClientConfig,
        expiration: DateTime<Utc>,
    }

    async fn setup(domain: &str, renew_commands: Vec<String>) -> Setup {
        let source = TempDir::new().unwrap();
        let written = TestCertificate::new(&["example.com"])
            .validity_days(60)
            .write_to(source.path())
            .unwrap();

        let identity = Identity::generate().unwrap();
        let public_key = identity.to_recipient().unwrap().to_string();
        let addr = spawn_server(CertificateServer::new(
            vec![source.path().to_path_buf()],
            vec![public_key],
        ))
        .await;

        let destination = TempDir::new().unwrap();
        let mut config = ClientConfig {
            interval_hours: None,
            connection: ConnectionConfig {
                server: format!("http://{}/", addr),
            },
            key: KeyConfig {
                public_key: None,
                private_key: identity.to_secret_string(),
            },
            certificate: vec![CertificateConfig {
                domain: domain.to_string(),
                directory: destination.path().join("live"),
                renew_commands,
            }],
        };
        config.validate().unwrap();

        Setup {
            source,
            destination,
            config,
            expiration: written.expiration,
        }
    }

    #[tokio::test]
    async fn test_install_then_up_to_date() {
        let s = setup("example.com", Vec::new()).await;
        let client = CertificateClient::new(&s.config).unwrap();
        let certificate = &s.config.certificate[0];

        let outcome = client.process_certificate(certificate).await.unwrap();
        let Outcome::Installed(mut paths) = outcome else {
            panic!("expected installation, got {:?}", outcome);
        };
        paths.sort();
        assert_eq!(
            paths,
            vec![
                certificate.directory.join("cert.pem"),
                certificate.directory.join("privkey.pem"),
            ]
        );
        assert_eq!(
            installed_expiration(&certificate.directory, "example.com"),
            Some(s.expiration)
        );

        let outcome = client.process_certificate(certificate).await.unwrap();
        assert_eq!(outcome, Outcome::UpToDate);
    }

    #[tokio::test]
    async fn test_older_local_certificate_is_replaced() {
        let s = setup("example.com", Vec::new()).await;
        let certificate = &s.config.certificate[0];
        fs::create_dir_all(&certificate.directory).unwrap();
        TestCertificate::new(&["example.com"])
            .expires_at(s.expiration - ChronoDuration::days(30))
            .write_to(&certificate.directory)
            .unwrap();

        let client = CertificateClient::new(&s.config).unwrap();
        let outcome = client.process_certificate(certificate).await.unwrap();
        assert!(matches!(outcome, Outcome::Installed(_)));
        assert_eq!(
            installed_expiration(&certificate.directory, "example.com"),
            Some(s.expiration)
        );
    }

    #[tokio::test]
    async fn test_renew_commands_run_after_install_only() {
        let marker_dir = TempDir::new().unwrap();
        let marker = marker_dir.path().join("renewed");
        let s = setup(
            "example.com",
            vec![format!("echo renewed >> {}", marker.display())],
        )
        .await;
        let client = CertificateClient::new(&s.config).unwrap();

        client.run(&s.config.certificate, None).await;
        client.run(&s.config.certificate, Some(0)).await;
        assert_eq!(fs::read_to_string(&marker).unwrap(), "renewed\n");
    }

    #[tokio::test]
    async fn test_unknown_domain_reports_status() {
        let s = setup("other.com", Vec::new()).await;
        let client = CertificateClient::new(&s.config).unwrap();

        let err = client
            .process_certificate(&s.config.certificate[0])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "{:#}", err);
        assert!(err.to_string().contains("Certificate not found"), "{:#}", err);
        assert!(!s.destination.path().join("live").exists());
    }

    #[tokio::test]
    async fn test_failing_renew_command_is_an_error_after_install() {
        let s = setup("example.com", vec!["exit 1".to_string()]).await;
        let client = CertificateClient::new(&s.config).unwrap();
        let certificate = &s.config.certificate[0];

        assert!(client.process_certificate(certificate).await.is_err());
        assert!(certificate.directory.join("cert.pem").exists());
    }

    #[tokio::test]
    async fn test_failing_domain_does_not_stop_the_cycle() {
        let mut s = setup("missing.org", Vec::new()).await;
        s.config.certificate.push(CertificateConfig {
            domain: "example.com".to_string(),
            directory: s.destination.path().join("example"),
            renew_commands: Vec::new(),
        });
        let client = CertificateClient::new(&s.config).unwrap();

        client.run_once(&s.config.certificate).await;
        assert!(!s.config.certificate[0].directory.exists());
        assert!(s.config.certificate[1].directory.join("cert.pem").exists());
        assert!(s.config.certificate[1].directory.join("privkey.pem").exists());
    }

    #[tokio::test]
    async fn test_undecryptable_bundle_is_not_installed() {
        let s = setup("example.com", Vec::new()).await;
        let stranger = Identity::generate()
            .unwrap()
            .to_recipient()
            .unwrap()
            .to_string();
        let addr = spawn_server(CertificateServer::new(
            vec![s.source.path().to_path_buf()],
            vec![stranger.clone()],
        ))
        .await;

        // The server seals for a key this client holds no identity for
        let mut config = s.config.clone();
        config.connection.server = format!("http://{}", addr);
        config.key.public_key = Some(stranger);
        let client = CertificateClient::new(&config).unwrap();

        let err = client
            .process_certificate(&config.certificate[0])
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to decrypt data"), "{:#}", err);
        assert!(!config.certificate[0].directory.exists());
    }

    #[test]
    fn test_polling_interval_saturates() {
        assert_eq!(polling_interval(2), Duration::from_secs(7200));
        assert_eq!(polling_interval(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
