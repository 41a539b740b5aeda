//! Fixtures for unit tests: self-signed certificates with SAN DNS entries,
//! written to disk next to their private key the way certbot lays them out.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Name, X509};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::webserver::{router, CertificateServer};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

pub(crate) struct TestCertificate {
    domains: Vec<String>,
    expiration: DateTime<Utc>,
}

pub(crate) struct WrittenCertificate {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub expiration: DateTime<Utc>,
}

impl TestCertificate {
    pub(crate) fn new(domains: &[&str]) -> Self {
        Self {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            expiration: Utc::now() + Duration::days(30),
        }
    }

    pub(crate) fn validity_days(mut self, days: i64) -> Self {
        self.expiration = Utc::now() + Duration::days(days);
        self
    }

    pub(crate) fn expires_at(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Write `cert.pem` and `privkey.pem` into `dir`.
    pub(crate) fn write_to(self, dir: &Path) -> Result<WrittenCertificate> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let ec_key = EcKey::generate(&group)?;
        let key_pem = ec_key.private_key_to_pem()?;
        let private_key = PKey::from_ec_key(ec_key)?;

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Test Corp")?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_after_unix = self.expiration.timestamp();
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::from_unix(not_after_unix)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&private_key)?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;

        if !self.domains.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for domain in &self.domains {
                san.dns(domain);
            }
            let san = san.build(&builder.x509v3_context(None, None))?;
            builder.append_extension(san)?;
        }

        builder.sign(&private_key, MessageDigest::sha256())?;
        let certificate = builder.build();

        let certificate_path = dir.join("cert.pem");
        let private_key_path = dir.join("privkey.pem");
        fs::write(&certificate_path, certificate.to_pem()?)?;
        fs::write(&private_key_path, key_pem)?;

        Ok(WrittenCertificate {
            certificate_path,
            private_key_path,
            expiration: DateTime::from_timestamp(not_after_unix, 0)
                .ok_or_else(|| anyhow!("expiration out of range"))?,
        })
    }
}

/// Serve `server` over plain HTTP on an ephemeral localhost port.
pub(crate) async fn spawn_server(server: CertificateServer) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(server)).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
