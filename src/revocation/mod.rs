//! Revocation checking
//!
//! Each presented certificate's status is resolved through a process-wide
//! [`RevocationCache`] keyed by `(issuer, serial)`. Misses go to a
//! [`RevocationSource`]:
//!
//! - [`CrlSource`] - CRLs from local files, configured URLs or the
//!   certificate's distribution points
//! - [`ResponderSource`] - an HTTP status responder returning JSON
//!
//! The [`RevocationChecker`] wraps a source with timeouts, retries,
//! single-flight de-duplication and the fail-open/closed policy.

pub mod cache;
pub mod checker;
pub mod crl;
pub mod responder;
pub mod retry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::Result;
use crate::cert::Certificate;

pub use cache::{CacheStatsSnapshot, RevocationCache};
pub use checker::RevocationChecker;
pub use crl::CrlSource;
pub use responder::ResponderSource;
pub use retry::RetryPolicy;

/// Revocation status of a single certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RevocationStatus {
    /// Not revoked according to the source
    Good,
    /// Revoked, with the source's reason (e.g. `keyCompromise`)
    Revoked {
        /// Reason string
        reason: String,
    },
    /// The source has no authoritative answer
    Unknown,
}

impl RevocationStatus {
    /// Short label used in logs and metrics
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Revoked { .. } => "revoked",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RevocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revoked { reason } => write!(f, "revoked ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Cache key: issuer DN (DER) and serial without leading zero bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevocationKey {
    issuer: Vec<u8>,
    serial: Vec<u8>,
}

impl RevocationKey {
    /// Key for `certificate`
    #[must_use]
    pub fn of(certificate: &Certificate) -> Self {
        Self {
            issuer: certificate.issuer().as_raw().to_vec(),
            serial: normalize_serial(certificate.serial()).to_vec(),
        }
    }
}

/// Strip leading zero bytes so sign-padded and minimal encodings compare equal.
pub(crate) fn normalize_serial(serial: &[u8]) -> &[u8] {
    let start = serial
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(serial.len().saturating_sub(1));
    &serial[start..]
}

/// A resolved status as stored in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevocationRecord {
    /// Issuer DN, one-line form
    pub issuer: String,
    /// Serial in lowercase hex
    pub serial: String,
    /// Resolved status
    pub status: RevocationStatus,
    /// When the source answered
    #[serde(skip)]
    pub checked_at: OffsetDateTime,
    /// How long the record may be served from cache
    #[serde(skip)]
    pub ttl: Duration,
}

/// One certificate to look up, with the certificate that issued it
#[derive(Debug, Clone, Copy)]
pub struct RevocationQuery<'a> {
    /// Certificate whose status is wanted
    pub certificate: &'a Certificate,
    /// Its issuer (used to verify CRL signatures and address responders)
    pub issuer: &'a Certificate,
}

/// What a source returned for a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAnswer {
    /// Status
    pub status: RevocationStatus,
    /// Upper bound for caching (CRL `nextUpdate`, responder hint)
    pub ttl_hint: Option<Duration>,
}

impl SourceAnswer {
    /// Answer without a TTL hint
    #[must_use]
    pub fn new(status: RevocationStatus) -> Self {
        Self {
            status,
            ttl_hint: None,
        }
    }
}

/// An external revocation authority
#[async_trait]
pub trait RevocationSource: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Resolve the status of one certificate
    async fn query(&self, query: RevocationQuery<'_>) -> Result<SourceAnswer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_normalization() {
        assert_eq!(normalize_serial(&[0x00, 0x80, 0x01]), &[0x80, 0x01]);
        assert_eq!(normalize_serial(&[0x00]), &[0x00]);
        assert_eq!(normalize_serial(&[0x05]), &[0x05]);
    }

    #[test]
    fn status_display() {
        assert_eq!(RevocationStatus::Good.to_string(), "good");
        assert_eq!(
            RevocationStatus::Revoked {
                reason: "keyCompromise".into()
            }
            .to_string(),
            "revoked (keyCompromise)"
        );
        assert_eq!(RevocationStatus::Unknown.label(), "unknown");
    }
}
