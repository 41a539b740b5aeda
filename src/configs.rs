use crate::encryption::{Identity, Recipient};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ================= Server =================

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Allow-list of recipient keys that may receive certificates
    #[serde(default)]
    pub public_keys: Vec<String>,
    pub server: ServerDetails,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerDetails {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub certificate_directories: Vec<PathBuf>,
    /// Serve HTTPS with this certificate chain (PEM); requires `tls_private_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_private_key: Option<PathBuf>,
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&config_str).context("Failed to parse server config file")
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&mut self) -> Result<()> {
        self.validate_server_details()?;
        self.validate_public_keys()
    }

    fn validate_server_details(&mut self) -> Result<()> {
        let details = &mut self.server;
        if details.listen_address.is_empty() {
            details.listen_address = default_listen_address();
        }
        if details.port == 0 {
            bail!("server.port is not configured");
        }
        if details.certificate_directories.is_empty() {
            bail!("at least one server.certificate_directories must be configured");
        }
        for dir in &details.certificate_directories {
            if !dir.exists() {
                bail!(
                    "configured certificate directory does not exist: {}",
                    dir.display()
                );
            }
        }
        match (&details.tls_certificate, &details.tls_private_key) {
            (Some(_), None) | (None, Some(_)) => {
                bail!("server.tls_certificate and server.tls_private_key must be set together")
            }
            _ => Ok(()),
        }
    }

    fn validate_public_keys(&self) -> Result<()> {
        if self.public_keys.is_empty() {
            bail!("at least one public_keys entry must be configured");
        }
        for key in &self.public_keys {
            key.parse::<Recipient>()
                .map_err(|e| anyhow!("invalid public_keys entry configured: {}: {}", key, e))?;
        }
        Ok(())
    }

    /// A sample configuration, printed by `certdist config server`
    pub fn example() -> Self {
        Self {
            public_keys: vec!["certdist1publickey".to_string()],
            server: ServerDetails {
                listen_address: default_listen_address(),
                port: 8080,
                certificate_directories: vec![PathBuf::from("/path/to/certificates")],
                tls_certificate: None,
                tls_private_key: None,
            },
        }
    }
}

// ================= Client =================

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    /// Hours between polling cycles; absent or 0 runs a single cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_hours: Option<u64>,
    pub connection: ConnectionConfig,
    pub key: KeyConfig,
    #[serde(default)]
    pub certificate: Vec<CertificateConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub server: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KeyConfig {
    /// Derived from `private_key` when left out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CertificateConfig {
    pub domain: String,
    /// Where the received certificate set is written
    pub directory: PathBuf,
    /// Shell commands run after a new certificate set was written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub renew_commands: Vec<String>,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&config_str).context("Failed to parse client config file")
    }

    /// Reject configurations the client cannot run with. Normalizes the server
    /// URL and fills in the public key derived from the private key.
    pub fn validate(&mut self) -> Result<()> {
        self.validate_connection()?;
        self.validate_keys()?;
        self.validate_certificates()
    }

    fn validate_connection(&mut self) -> Result<()> {
        let server = &mut self.connection.server;
        if server.is_empty() {
            bail!("connection.server is not configured");
        }

        if server.starts_with("http://") {
            warn!(server = %server, "Using insecure HTTP connection");
        } else if !server.starts_with("https://") {
            *server = format!("https://{}", server);
            info!(server = %server, "Unknown protocol, assuming HTTPS");
        }

        while server.ends_with('/') {
            server.pop();
        }
        Ok(())
    }

    fn validate_keys(&mut self) -> Result<()> {
        if self.key.private_key.is_empty() {
            bail!("key.private_key is not configured");
        }

        let identity: Identity = self
            .key
            .private_key
            .parse()
            .context("invalid key.private_key")?;
        let derived = identity.to_recipient()?.to_string();

        match self.key.public_key.as_deref() {
            None => {}
            Some(configured) if configured.trim() == derived => {}
            Some(_) => bail!("key.public_key does not correspond to key.private_key"),
        }
        self.key.public_key = Some(derived);
        Ok(())
    }

    fn validate_certificates(&self) -> Result<()> {
        if self.certificate.is_empty() {
            bail!("at least one certificate must be configured");
        }
        for (i, certificate) in self.certificate.iter().enumerate() {
            if certificate.domain.is_empty() {
                bail!("certificate {}: domain is not configured", i);
            }
            if certificate.directory.as_os_str().is_empty() {
                bail!(
                    "certificate {}: directory is not configured for domain {}",
                    i,
                    certificate.domain
                );
            }
        }
        Ok(())
    }

    /// A sample configuration, printed by `certdist config client`
    pub fn example() -> Self {
        Self {
            interval_hours: Some(24),
            connection: ConnectionConfig {
                server: "localhost:8080".to_string(),
            },
            key: KeyConfig {
                public_key: None,
                private_key: "CERTDIST-SECRET-KEY-1privatekey".to_string(),
            },
            certificate: vec![CertificateConfig {
                domain: "example.com".to_string(),
                directory: PathBuf::from("/path/to/output/dir"),
                renew_commands: vec![
                    "echo 'renewing certificate cmd 1'".to_string(),
                    "echo 'cmd 2'".to_string(),
                ],
            }],
        }
    }
}
