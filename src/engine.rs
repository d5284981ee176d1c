//! Authentication decision engine
//!
//! Drives one connection attempt through parse, validate, revocation and
//! identity mapping, and turns the first failure into a `Deny` carrying a
//! client-safe [`ReasonCode`]. The full diagnostic stays in the outcome and
//! the log.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::Result;
use crate::cert::{
    ParseLimits, TrustStore, ValidatedChain, ValidationPolicy, parse_der_chain, parse_pem_chain,
    validate,
};
use crate::config::Config;
use crate::error::{AuthError, ReasonCode};
use crate::identity::{IdentityRule, Principal, map_identity};
use crate::revocation::RevocationChecker;

// ─────────────────────────────────────────────────────────────────────────────
// Request / outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Certificates as presented by the TLS layer, leaf first
#[derive(Debug, Clone)]
pub enum PresentedChain {
    /// One DER blob per certificate
    Der(Vec<Vec<u8>>),
    /// One PEM buffer with `CERTIFICATE` blocks
    Pem(Vec<u8>),
}

/// Diagnostic metadata about the connection; never used for decisions
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Client identifier announced by the broker client
    pub client_id: Option<String>,
    /// Peer address
    pub remote_addr: Option<String>,
    /// Listener name
    pub listener: Option<String>,
}

/// One connection attempt
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Presented chain
    pub chain: PresentedChain,
    /// Connection metadata
    pub connection: ConnectionInfo,
}

impl AuthRequest {
    /// Request for DER blobs with no connection metadata
    #[must_use]
    pub fn der(chain: Vec<Vec<u8>>) -> Self {
        Self {
            chain: PresentedChain::Der(chain),
            connection: ConnectionInfo::default(),
        }
    }

    /// Request for a PEM buffer with no connection metadata
    #[must_use]
    pub fn pem(pem: impl Into<Vec<u8>>) -> Self {
        Self {
            chain: PresentedChain::Pem(pem.into()),
            connection: ConnectionInfo::default(),
        }
    }

    /// Attach connection metadata
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = connection;
        self
    }
}

/// Final answer for a connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "lowercase")]
pub enum AuthDecision {
    /// Accept the connection as this principal
    Allow(Principal),
    /// Refuse the connection
    Deny(ReasonCode),
}

impl AuthDecision {
    /// Whether the connection is accepted
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    /// Principal of an accepted connection
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Allow(principal) => Some(principal),
            Self::Deny(_) => None,
        }
    }

    /// Reason of a refused connection
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Allow(_) => None,
            Self::Deny(reason) => Some(*reason),
        }
    }
}

impl fmt::Display for AuthDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow(principal) => write!(f, "ALLOW {principal}"),
            Self::Deny(reason) => write!(f, "DENY {reason}"),
        }
    }
}

/// Stages of an attempt, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// Request accepted for processing
    Received,
    /// Chain decoded
    Parsed,
    /// Path anchored, signatures and constraints verified
    Validated,
    /// Revocation status established (or tolerated)
    RevocationChecked,
    /// Decision reached
    Decided,
}

/// Decision plus what happened along the way
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// The decision
    pub decision: AuthDecision,
    /// States visited, ending in `Decided`
    pub trace: Vec<AuthState>,
    /// Wall time spent on the attempt
    pub elapsed: Duration,
    /// Operator diagnostic for a deny; never sent to the client
    pub error: Option<AuthError>,
    /// Issuer DN of the leaf, once the chain has been parsed
    pub leaf_issuer: Option<String>,
}

impl AuthOutcome {
    /// Last state reached before the decision
    pub fn last_completed(&self) -> AuthState {
        self.trace
            .iter()
            .rev()
            .copied()
            .find(|state| *state != AuthState::Decided)
            .unwrap_or(AuthState::Received)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Decision counters
#[derive(Debug, Default)]
pub struct AuthStats {
    allowed: AtomicU64,
    denied: AtomicU64,
    revoked: AtomicU64,
}

impl AuthStats {
    fn record(&self, decision: &AuthDecision) {
        match decision {
            AuthDecision::Allow(_) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            AuthDecision::Deny(reason) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                if *reason == ReasonCode::RevocationStatusRevoked {
                    self.revoked.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> AuthStatsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let denied = self.denied.load(Ordering::Relaxed);
        AuthStatsSnapshot {
            allowed,
            denied,
            revoked: self.revoked.load(Ordering::Relaxed),
            total: allowed + denied,
        }
    }
}

/// Serializable decision counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthStatsSnapshot {
    /// Connections allowed
    pub allowed: u64,
    /// Connections denied
    pub denied: u64,
    /// Denials due to a revoked certificate
    pub revoked: u64,
    /// All decisions
    pub total: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Authenticator
// ─────────────────────────────────────────────────────────────────────────────

/// Per-process authenticator; cheap to share behind an `Arc`
pub struct Authenticator {
    trust: Arc<TrustStore>,
    limits: ParseLimits,
    policy: ValidationPolicy,
    identity_rule: IdentityRule,
    revocation: RevocationChecker,
    stats: AuthStats,
}

impl Authenticator {
    /// Assemble an authenticator from its parts
    pub fn new(
        trust: Arc<TrustStore>,
        identity_rule: IdentityRule,
        revocation: RevocationChecker,
    ) -> Self {
        Self {
            trust,
            limits: ParseLimits::default(),
            policy: ValidationPolicy::default(),
            identity_rule,
            revocation,
            stats: AuthStats::default(),
        }
    }

    /// Build everything `config` describes, loading the trust anchors from disk
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, unreadable anchors or a
    /// revocation source that cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let trust = Arc::new(TrustStore::load(config.require_trust_anchor_path()?)?);
        let revocation = RevocationChecker::from_config(&config.revocation)?;

        Ok(Self::new(trust, config.identity_rule.clone(), revocation)
            .with_limits(config.parse_limits())
            .with_policy(config.validation_policy()))
    }

    /// Override parser limits
    #[must_use]
    pub fn with_limits(mut self, limits: ParseLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Override validation policy
    #[must_use]
    pub fn with_policy(mut self, policy: ValidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Trust store consulted by every attempt
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Revocation checker
    pub fn revocation(&self) -> &RevocationChecker {
        &self.revocation
    }

    /// Decision counters
    pub fn stats(&self) -> &AuthStats {
        &self.stats
    }

    /// Decide a connection attempt at the current time
    pub async fn authenticate(&self, request: AuthRequest) -> AuthOutcome {
        self.authenticate_at(request, OffsetDateTime::now_utc()).await
    }

    /// Decide a connection attempt as of `now`
    pub async fn authenticate_at(&self, request: AuthRequest, now: OffsetDateTime) -> AuthOutcome {
        let started = Instant::now();
        let mut trace = vec![AuthState::Received];
        let mut leaf_issuer = None;

        let result = self.run(&request, now, &mut trace, &mut leaf_issuer).await;
        trace.push(AuthState::Decided);

        let (decision, error) = match result {
            Ok(principal) => (AuthDecision::Allow(principal), None),
            Err(e) => (AuthDecision::Deny(e.reason()), Some(e)),
        };
        let outcome = AuthOutcome {
            decision,
            trace,
            elapsed: started.elapsed(),
            error,
            leaf_issuer,
        };

        self.report(&request.connection, &outcome);
        outcome
    }

    async fn run(
        &self,
        request: &AuthRequest,
        now: OffsetDateTime,
        trace: &mut Vec<AuthState>,
        leaf_issuer: &mut Option<String>,
    ) -> std::result::Result<Principal, AuthError> {
        let chain = match &request.chain {
            PresentedChain::Der(blobs) => parse_der_chain(blobs, &self.limits)?,
            PresentedChain::Pem(pem) => parse_pem_chain(pem, &self.limits)?,
        };
        trace.push(AuthState::Parsed);
        *leaf_issuer = Some(chain.leaf().issuer().to_string());

        // One snapshot per attempt; a concurrent reload does not affect it.
        let anchors = self.trust.snapshot();
        let validated: ValidatedChain = validate(chain, &anchors, now, &self.policy)?;
        trace.push(AuthState::Validated);

        self.revocation.check(&validated).await?;
        trace.push(AuthState::RevocationChecked);

        map_identity(&validated, &self.identity_rule)
    }

    fn report(&self, connection: &ConnectionInfo, outcome: &AuthOutcome) {
        self.stats.record(&outcome.decision);

        let client_id = connection.client_id.as_deref().unwrap_or("-");
        let remote_addr = connection.remote_addr.as_deref().unwrap_or("-");
        let listener = connection.listener.as_deref().unwrap_or("-");
        let issuer = outcome.leaf_issuer.as_deref().unwrap_or("-");
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        match (&outcome.decision, &outcome.error) {
            (AuthDecision::Allow(principal), _) => {
                info!(
                    client_id,
                    remote_addr,
                    listener,
                    issuer,
                    principal = principal.client_id(),
                    elapsed_ms,
                    "Client certificate accepted"
                );
                record_decision("allow", "none", listener);
            }
            (AuthDecision::Deny(reason), error) => {
                let detail = error.as_ref().map(ToString::to_string).unwrap_or_default();
                warn!(
                    client_id,
                    remote_addr,
                    listener,
                    issuer,
                    reason = reason.as_str(),
                    detail = %detail,
                    stage = ?outcome.last_completed(),
                    elapsed_ms,
                    "Client certificate rejected"
                );
                record_decision("deny", reason.as_str(), listener);
            }
        }
        debug!(trace = ?outcome.trace, "Authentication trace");
    }
}

fn record_decision(outcome: &'static str, reason: &'static str, listener: &str) {
    telemetry_metrics::counter!(
        "x509_auth_decisions_total",
        "outcome" => outcome,
        "reason" => reason,
        "listener" => listener.to_owned()
    )
    .increment(1);
}
