//! Client certificate inspection
//!
//! The TLS layer has already verified the chain against the configured CA.
//! This module pulls out the fields identity resolution needs.

use crate::{KmeError, Result};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fields of a peer certificate relevant to SAE identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    pub common_name: Option<String>,
    /// Lowercase hex SHA-256 of the DER encoding
    pub fingerprint: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl PeerCertificate {
    /// Parse a DER encoded X.509 certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| KmeError::Authentication(format!("unparseable certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(|cn| cn.to_string());

        let validity = cert.validity();

        Ok(PeerCertificate {
            common_name,
            fingerprint: fingerprint(der),
            not_before: from_unix(validity.not_before.timestamp()),
            not_after: from_unix(validity.not_after.timestamp()),
        })
    }

    /// Check the validity window against `now`
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

/// SHA-256 fingerprint of a DER certificate, as lowercase hex
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn from_unix(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(timestamp.unsigned_abs())
    }
}

mod hex {
    use std::fmt::Write;

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut output, b| {
            let _ = write!(output, "{:02x}", b);
            output
        })
    }
}
