//! Protocol Module
//!
//! Defines the HTTP wire protocol between certdist clients and the server:
//! endpoints, the JSON certificate request, and its (de)serialization.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Certificate requests are POSTed here
pub const CERTIFICATE_REQUEST_ENDPOINT: &str = "/api/v1/certificate-request";
/// Liveness probe, always answers `OK`
pub const HEALTH_ENDPOINT: &str = "/health";
/// Content type of the encrypted archive in a `200` response
pub const ENCRYPTED_CONTENT_TYPE: &str = "application/octet-stream";

/// Body of a certificate request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CertificateRequest {
    /// Missing string fields decode as empty, like the zero expiration
    #[serde(default)]
    pub domain: String,
    /// Recipient key of the requester, also checked against the allow-list
    #[serde(default, rename = "age_public_key")]
    pub public_key: String,
    /// Expiration of the certificate the requester already holds, if any
    #[serde(default, with = "zero_time")]
    pub expiration: Option<DateTime<Utc>>,
}

/// Serialize a CertificateRequest to a JSON body
///
/// # Example
/// ```
/// use certdist::protocol::{serialize_request, CertificateRequest};
///
/// let request = CertificateRequest {
///     domain: "example.com".to_string(),
///     public_key: "certdist1...".to_string(),
///     expiration: None,
/// };
/// let body = serialize_request(&request)?;
/// assert!(body.windows(20).any(|w| w == b"0001-01-01T00:00:00Z"));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn serialize_request(request: &CertificateRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(request).context("Failed to serialize request to JSON")
}

/// Deserialize a JSON body to a CertificateRequest
pub fn deserialize_request(bytes: &[u8]) -> Result<CertificateRequest> {
    serde_json::from_slice(bytes).context("Failed to deserialize JSON to CertificateRequest")
}

/// "No certificate held" travels as the zero timestamp `0001-01-01T00:00:00Z`.
/// On input, that value, `null` and an absent field all mean `None`.
mod zero_time {
    use chrono::{DateTime, NaiveDate, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

    fn zero() -> Option<DateTime<Utc>> {
        NaiveDate::from_ymd_opt(1, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&time.to_rfc3339()),
            None => serializer.serialize_str(ZERO_TIME),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value: Option<DateTime<Utc>> = Option::deserialize(deserializer)?;
        Ok(value.filter(|time| Some(*time) != zero()))
    }
}
