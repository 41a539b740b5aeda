//! Certificate Store Scanner
//!
//! Reads certificate directories and classifies every PEM file in them. Only the
//! first PEM block of a file is looked at: `fullchain.pem` carries the leaf
//! first and the chain appended after it, and only the leaf matters here.
//!
//! Nothing is cached. Every call re-reads the directories from disk.

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::error::ErrorStack;
use openssl::x509::X509;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_PEM_TAG: &str = "PRIVATE KEY";

/// Kind of PEM material a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Certificate,
    PrivateKey,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Certificate => write!(f, "Public Certificate"),
            FileKind::PrivateKey => write!(f, "Private Key"),
        }
    }
}

/// One parsed PEM file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFile {
    pub path: PathBuf,
    pub kind: FileKind,
    /// SAN DNS names; empty for private keys
    pub domains: Vec<String>,
    /// NotAfter of the certificate; `None` for private keys
    pub expiration: Option<DateTime<Utc>>,
}

/// All successfully parsed files of one directory, in scan order
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    pub directory: PathBuf,
    pub files: Vec<CertificateFile>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to decode PEM block: {0}")]
    Pem(#[from] pem::PemError),
    #[error("failed to parse certificate: {0}")]
    Certificate(#[from] ErrorStack),
    #[error("certificate expiration is out of range")]
    Expiration,
    #[error("unhandled PEM block type: {0}")]
    UnhandledType(String),
}

/// Parse a single PEM file into a [`CertificateFile`].
pub fn parse_certificate_file(path: &Path) -> Result<CertificateFile, ScanError> {
    let data = fs::read(path)?;
    let block = pem::parse(&data)?;

    if block.tag() == CERTIFICATE_PEM_TAG {
        let certificate = X509::from_der(block.contents())?;
        let domains = certificate
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(CertificateFile {
            path: path.to_path_buf(),
            kind: FileKind::Certificate,
            domains,
            expiration: Some(asn1_to_datetime(certificate.not_after())?),
        })
    } else if block.tag().contains(PRIVATE_KEY_PEM_TAG) {
        Ok(CertificateFile {
            path: path.to_path_buf(),
            kind: FileKind::PrivateKey,
            domains: Vec::new(),
            expiration: None,
        })
    } else {
        Err(ScanError::UnhandledType(block.tag().to_string()))
    }
}

fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>, ScanError> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0).ok_or(ScanError::Expiration)
}

/// Scan one directory (non-recursive). Files that fail to parse are skipped
/// with a warning; only failing to list the directory itself is an error.
pub fn scan_directory(directory: &Path) -> io::Result<DirectoryIndex> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Failed to read directory entry");
                continue;
            }
        };
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => continue,
            Ok(_) => entries.push(entry.path()),
            Err(e) => {
                warn!(file = %entry.path().display(), error = %e, "Failed to stat directory entry");
            }
        }
    }
    entries.sort();

    let mut files = Vec::with_capacity(entries.len());
    for path in entries {
        match parse_certificate_file(&path) {
            Ok(file) => files.push(file),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to parse certificate file");
            }
        }
    }

    Ok(DirectoryIndex {
        directory: directory.to_path_buf(),
        files,
    })
}

/// Scan every directory in order. Unreadable directories are logged and left
/// out of the result.
pub fn scan_directories<P: AsRef<Path>>(directories: &[P]) -> Vec<DirectoryIndex> {
    let mut indices = Vec::with_capacity(directories.len());
    for directory in directories {
        let directory = directory.as_ref();
        info!(directory = %directory.display(), "Parsing certificate directory");
        match scan_directory(directory) {
            Ok(index) => indices.push(index),
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Failed to read certificate directory");
            }
        }
    }
    log_indices(&indices);
    indices
}

fn log_indices(indices: &[DirectoryIndex]) {
    for index in indices {
        debug!(directory = %index.directory.display(), files = index.files.len(), "Certificates found in directory");
        for file in &index.files {
            debug!(
                file = %file.path.display(),
                kind = %file.kind,
                expiration = ?file.expiration,
                domains = %file.domains.join(", "),
                "Certificate file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestCertificate;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_parse_certificate() {
        let dir = TempDir::new().unwrap();
        let written = TestCertificate::new(&["example.com", "www.example.com"])
            .validity_days(30)
            .write_to(dir.path())
            .unwrap();

        let file = parse_certificate_file(&written.certificate_path).unwrap();
        assert_eq!(file.kind, FileKind::Certificate);
        assert_eq!(file.domains, vec!["example.com", "www.example.com"]);

        let expected = Utc::now() + Duration::days(30);
        let expiration = file.expiration.unwrap();
        assert!((expiration - expected).num_seconds().abs() < 60);
        assert_eq!(expiration, written.expiration);
    }

    #[test]
    fn test_parse_private_key() {
        let dir = TempDir::new().unwrap();
        let written = TestCertificate::new(&["example.com"])
            .write_to(dir.path())
            .unwrap();

        let file = parse_certificate_file(&written.private_key_path).unwrap();
        assert_eq!(file.kind, FileKind::PrivateKey);
        assert!(file.domains.is_empty());
        assert!(file.expiration.is_none());
    }

    #[test]
    fn test_only_first_block_is_used() {
        let dir = TempDir::new().unwrap();
        let leaf = TestCertificate::new(&["leaf.example.com"])
            .write_to(dir.path())
            .unwrap();
        let chain_dir = TempDir::new().unwrap();
        let chain = TestCertificate::new(&["intermediate.example.net"])
            .write_to(chain_dir.path())
            .unwrap();

        let mut fullchain = fs::read(&leaf.certificate_path).unwrap();
        fullchain.extend(fs::read(&chain.certificate_path).unwrap());
        let path = dir.path().join("fullchain.pem");
        fs::write(&path, fullchain).unwrap();

        let file = parse_certificate_file(&path).unwrap();
        assert_eq!(file.domains, vec!["leaf.example.com"]);
    }

    #[test]
    fn test_parse_errors() {
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            parse_certificate_file(&dir.path().join("nonexistent.pem")),
            Err(ScanError::Read(_))
        ));

        let invalid = dir.path().join("invalid.pem");
        fs::write(&invalid, "not a pem file").unwrap();
        assert!(matches!(
            parse_certificate_file(&invalid),
            Err(ScanError::Pem(_))
        ));

        let csr = dir.path().join("request.csr");
        fs::write(
            &csr,
            "-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n",
        )
        .unwrap();
        assert!(matches!(
            parse_certificate_file(&csr),
            Err(ScanError::UnhandledType(tag)) if tag == "CERTIFICATE REQUEST"
        ));

        let garbage = dir.path().join("garbage.pem");
        fs::write(
            &garbage,
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        assert!(matches!(
            parse_certificate_file(&garbage),
            Err(ScanError::Certificate(_))
        ));
    }

    #[test]
    fn test_scan_directory_with_certificate_and_key() {
        let dir = TempDir::new().unwrap();
        TestCertificate::new(&["example.com"])
            .write_to(dir.path())
            .unwrap();

        let indices = scan_directories(&[dir.path()]);
        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].directory, dir.path());

        let kinds: Vec<FileKind> = indices[0].files.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FileKind::Certificate, FileKind::PrivateKey]);
    }

    #[test]
    fn test_scan_skips_unparseable_files_and_subdirectories() {
        let dir = TempDir::new().unwrap();
        TestCertificate::new(&["example.com"])
            .write_to(dir.path())
            .unwrap();
        fs::write(dir.path().join("README"), "These files are managed elsewhere").unwrap();
        fs::write(
            dir.path().join("params.pem"),
            "-----BEGIN DH PARAMETERS-----\nAAAA\n-----END DH PARAMETERS-----\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("archive")).unwrap();

        let indices = scan_directories(&[dir.path()]);
        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].files.len(), 2);
    }

    #[test]
    fn test_scan_skips_missing_directory() {
        let dir = TempDir::new().unwrap();
        TestCertificate::new(&["example.com"])
            .write_to(dir.path())
            .unwrap();

        let missing = dir.path().join("nonexistentdir");
        let indices = scan_directories(&[missing.as_path(), dir.path()]);
        assert_eq!(indices.len(), 1);
        assert_eq!(indices[0].directory, dir.path());
    }
}
