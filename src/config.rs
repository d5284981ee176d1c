//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::cert::parser::{DEFAULT_MAX_CERTIFICATE_BYTES, DEFAULT_MAX_CHAIN_LENGTH};
use crate::cert::{ParseLimits, ValidationPolicy};
use crate::identity::IdentityRule;
use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "X509_AUTH_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// PEM/DER file or directory holding the trust anchors
    pub trust_anchor_path: Option<PathBuf>,
    /// Reload trust anchors when the path changes on disk
    pub watch_trust_anchors: bool,
    /// Identity extraction expression (e.g. `subject.cn`, `san.uri:spiffe://|subject.cn`)
    pub identity_rule: IdentityRule,
    /// Maximum presented chain length
    pub max_chain_length: usize,
    /// Maximum DER size of a single certificate
    pub max_certificate_bytes: usize,
    /// Reject chains whose leaf is a CA certificate
    pub require_end_entity_leaf: bool,
    /// Revocation checking
    pub revocation: RevocationConfig,
    /// Broker connect-hook behaviour
    pub adapter: AdapterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust_anchor_path: None,
            watch_trust_anchors: false,
            identity_rule: IdentityRule::default(),
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            max_certificate_bytes: DEFAULT_MAX_CERTIFICATE_BYTES,
            require_end_entity_leaf: true,
            revocation: RevocationConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_chain_length == 0 {
            return Err(Error::Config("max_chain_length must be at least 1".into()));
        }
        if self.max_certificate_bytes == 0 {
            return Err(Error::Config("max_certificate_bytes must be positive".into()));
        }
        self.revocation.validate()
    }

    /// Trust anchor path, required to build an authenticator
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no path is configured.
    pub fn require_trust_anchor_path(&self) -> Result<&Path> {
        self.trust_anchor_path
            .as_deref()
            .ok_or_else(|| Error::Config("trust_anchor_path is not set".into()))
    }

    /// Parser limits derived from this configuration
    #[must_use]
    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_chain_length: self.max_chain_length,
            max_certificate_bytes: self.max_certificate_bytes,
        }
    }

    /// Validator policy derived from this configuration
    #[must_use]
    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            require_end_entity_leaf: self.require_end_entity_leaf,
        }
    }
}

/// Where revocation status comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationMode {
    /// Certificate revocation lists
    #[default]
    #[serde(alias = "CRL")]
    Crl,
    /// HTTP status responder
    #[serde(alias = "OCSP")]
    Ocsp,
    /// No revocation checking
    #[serde(alias = "DISABLED")]
    Disabled,
}

/// What to do when revocation status cannot be established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Deny the connection
    #[default]
    #[serde(alias = "CLOSED")]
    Closed,
    /// Log a warning and continue as if Good
    #[serde(alias = "OPEN")]
    Open,
}

/// Revocation checking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Source selection
    pub mode: RevocationMode,
    /// Behaviour on unknown status or source failure
    pub fail_policy: FailPolicy,
    /// Upper bound on how long a status is cached
    pub cache_ttl_seconds: u64,
    /// How long an `unknown` answer is cached
    #[serde(with = "humantime_serde")]
    pub unknown_ttl: Duration,
    /// Deadline for each query attempt
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// How often expired cache records are swept
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Local CRL files (PEM or DER)
    pub crl_files: Vec<PathBuf>,
    /// CRL URLs fetched over HTTP
    pub crl_urls: Vec<String>,
    /// Also fetch CRLs from the certificate's distribution points
    pub use_distribution_points: bool,
    /// Status responder URL (required in `ocsp` mode)
    pub responder_url: Option<String>,
    /// Retry behaviour for failed queries
    pub retry: RetryConfig,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            mode: RevocationMode::Crl,
            fail_policy: FailPolicy::Closed,
            cache_ttl_seconds: 300,
            unknown_ttl: Duration::from_secs(30),
            query_timeout: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(60),
            crl_files: Vec::new(),
            crl_urls: Vec::new(),
            use_distribution_points: true,
            responder_url: None,
            retry: RetryConfig::default(),
        }
    }
}

impl RevocationConfig {
    /// Cache TTL as a duration
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.query_timeout.is_zero() {
            return Err(Error::Config("revocation.query_timeout must be positive".into()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::Config("revocation.cleanup_interval must be positive".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("revocation.retry.multiplier must be >= 1.0".into()));
        }
        match self.mode {
            RevocationMode::Ocsp if self.responder_url.as_deref().is_none_or(str::is_empty) => Err(
                Error::Config("revocation.responder_url is required in ocsp mode".into()),
            ),
            RevocationMode::Crl
                if self.crl_files.is_empty()
                    && self.crl_urls.is_empty()
                    && !self.use_distribution_points =>
            {
                Err(Error::Config(
                    "crl mode needs crl_files, crl_urls or use_distribution_points".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Action on a denied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDeny {
    /// Refuse the connection with the reason code
    #[default]
    Reject,
    /// Hand the connection to the next authenticator in the broker chain
    Next,
}

/// Connect-hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Refuse clients that present no certificate
    pub require_client_cert: bool,
    /// Action on a denied connection
    pub on_deny: OnDeny,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            require_client_cert: true,
            on_deny: OnDeny::Reject,
        }
    }
}

/// Human-readable `Duration` serde ("2s", "500ms", "5m")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration as milliseconds or whole seconds
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            let mins = mins.trim().parse::<u64>().map_err(serde::de::Error::custom)?;
            mins.checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| serde::de::Error::custom(format!("duration '{s}' is out of range")))
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
