//! Error types for broker X.509 authentication
//!
//! Two layers:
//!
//! - [`Error`] covers operational failures (configuration, I/O, revocation
//!   sources). These are what `Result<T>` carries through the crate.
//! - [`AuthError`] is the per-connection denial taxonomy. Every variant is
//!   terminal for the connection attempt and collapses to a [`ReasonCode`]
//!   before anything reaches the connecting client.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for broker X.509 authentication
pub type Result<T> = std::result::Result<T, Error>;

/// Operational errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Trust anchor store could not be loaded
    #[error("Trust store error: {0}")]
    TrustStore(String),

    /// Revocation source failed (transport, protocol, stale data)
    #[error("Revocation source error: {0}")]
    Revocation(String),

    /// Revocation data that can never become valid (undecodable CRL, bad
    /// signature); retrying does not help
    #[error("Revocation data rejected: {0}")]
    RevocationData(String),

    /// Revocation source did not answer in time
    #[error("Revocation query timed out after {0:?}")]
    Timeout(Duration),

    /// Certificate generation or encoding failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Responder reply was not the expected JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a revocation query that failed with this error may be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Revocation(_) | Self::Timeout(_) | Self::Http(_)
        )
    }
}

/// Client-visible reason attached to a denied connection.
///
/// Carries no diagnostic detail: positions, distinguished names and source
/// errors stay in the operator log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Certificate bytes could not be decoded or exceeded size limits
    MalformedCertificate,
    /// No certificate was presented
    EmptyChain,
    /// A certificate is outside its validity window
    ExpiredCertificate,
    /// The chain does not terminate at a trust anchor
    UntrustedIssuer,
    /// A signature does not verify under its issuer's key
    SignatureMismatch,
    /// Basic constraints, key usage or critical extensions forbid the chain
    ConstraintViolation,
    /// Revocation status could not be established
    RevocationCheckFailed,
    /// A certificate in the chain is revoked
    RevocationStatusRevoked,
    /// The identity rule found nothing to map
    NoMatchingAttribute,
}

impl ReasonCode {
    /// Stable wire identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedCertificate => "MALFORMED_CERTIFICATE",
            Self::EmptyChain => "EMPTY_CHAIN",
            Self::ExpiredCertificate => "EXPIRED_CERTIFICATE",
            Self::UntrustedIssuer => "UNTRUSTED_ISSUER",
            Self::SignatureMismatch => "SIGNATURE_MISMATCH",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::RevocationCheckFailed => "REVOCATION_CHECK_FAILED",
            Self::RevocationStatusRevoked => "REVOCATION_STATUS_REVOKED",
            Self::NoMatchingAttribute => "NO_MATCHING_ATTRIBUTE",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection attempt was denied, with operator diagnostics.
///
/// `position` is the index in the presented chain (0 = leaf). A position equal
/// to the chain length refers to the trust anchor the chain was linked to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unparseable encoding, broken linkage or size limit exceeded
    #[error("malformed certificate at position {position}: {detail}")]
    MalformedCertificate {
        /// Offending certificate
        position: usize,
        /// Parser diagnostic
        detail: String,
    },

    /// No certificates presented
    #[error("no client certificate presented")]
    EmptyChain,

    /// Outside the validity window
    #[error("certificate at position {position} ({subject}) is {}", expiry_state(.not_yet_valid))]
    ExpiredCertificate {
        /// Offending certificate
        position: usize,
        /// Subject DN of the offending certificate
        subject: String,
        /// `true` when `now < notBefore`
        not_yet_valid: bool,
    },

    /// Chain does not terminate at a trust anchor
    #[error("certificate at position {position} is issued by untrusted '{issuer}'")]
    UntrustedIssuer {
        /// Last presented certificate
        position: usize,
        /// Issuer DN that failed to resolve to an anchor
        issuer: String,
    },

    /// Signature does not verify under the issuer key
    #[error("signature of certificate at position {position} does not verify: {detail}")]
    SignatureMismatch {
        /// Offending certificate
        position: usize,
        /// Verifier diagnostic
        detail: String,
    },

    /// Role not permitted by basic constraints / key usage
    #[error("constraint violation at position {position}: {detail}")]
    ConstraintViolation {
        /// Offending certificate
        position: usize,
        /// Which constraint failed
        detail: String,
    },

    /// Revocation status unavailable under a fail-closed policy
    #[error("revocation check failed for certificate at position {position}: {detail}")]
    RevocationCheckFailed {
        /// Certificate whose status is unknown
        position: usize,
        /// Source error or `unknown`
        detail: String,
    },

    /// Revoked certificate in the chain
    #[error("certificate at position {position} (serial {serial}) is revoked: {reason}")]
    RevocationStatusRevoked {
        /// Revoked certificate
        position: usize,
        /// Serial in lowercase hex
        serial: String,
        /// CRL / responder reason
        reason: String,
    },

    /// Identity rule matched nothing
    #[error("identity rule '{rule}' matched no attribute")]
    NoMatchingAttribute {
        /// Rule expression as configured
        rule: String,
    },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn expiry_state(not_yet_valid: &bool) -> &'static str {
    if *not_yet_valid { "not yet valid" } else { "expired" }
}

impl AuthError {
    /// Collapse to the client-visible reason code
    #[must_use]
    pub const fn reason(&self) -> ReasonCode {
        match self {
            Self::MalformedCertificate { .. } => ReasonCode::MalformedCertificate,
            Self::EmptyChain => ReasonCode::EmptyChain,
            Self::ExpiredCertificate { .. } => ReasonCode::ExpiredCertificate,
            Self::UntrustedIssuer { .. } => ReasonCode::UntrustedIssuer,
            Self::SignatureMismatch { .. } => ReasonCode::SignatureMismatch,
            Self::ConstraintViolation { .. } => ReasonCode::ConstraintViolation,
            Self::RevocationCheckFailed { .. } => ReasonCode::RevocationCheckFailed,
            Self::RevocationStatusRevoked { .. } => ReasonCode::RevocationStatusRevoked,
            Self::NoMatchingAttribute { .. } => ReasonCode::NoMatchingAttribute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_source_errors_are_retryable() {
        assert!(Error::Revocation("connection reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(2)).is_retryable());
        assert!(!Error::RevocationData("bad CRL signature".into()).is_retryable());
        assert!(!Error::Config("missing url".into()).is_retryable());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!Error::from(json).is_retryable());
    }

    #[test]
    fn reason_codes_are_stable_identifiers() {
        assert_eq!(ReasonCode::UntrustedIssuer.as_str(), "UNTRUSTED_ISSUER");
        assert_eq!(
            ReasonCode::RevocationStatusRevoked.to_string(),
            "REVOCATION_STATUS_REVOKED"
        );
    }

    #[test]
    fn reason_code_serializes_like_as_str() {
        let json = serde_json::to_string(&ReasonCode::EmptyChain).unwrap();
        assert_eq!(json, "\"EMPTY_CHAIN\"");
        let json = serde_json::to_string(&ReasonCode::NoMatchingAttribute).unwrap();
        assert_eq!(json, "\"NO_MATCHING_ATTRIBUTE\"");
    }

    #[test]
    fn auth_error_maps_to_reason() {
        let err = AuthError::ExpiredCertificate {
            position: 0,
            subject: "CN=device-42".to_string(),
            not_yet_valid: false,
        };
        assert_eq!(err.reason(), ReasonCode::ExpiredCertificate);
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn not_yet_valid_is_reported_in_message() {
        let err = AuthError::ExpiredCertificate {
            position: 1,
            subject: "CN=IntermediateCA".to_string(),
            not_yet_valid: true,
        };
        assert!(err.to_string().contains("not yet valid"));
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(Error::Revocation("connection reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(2)).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::TrustStore("empty".into()).is_retryable());
    }
}
