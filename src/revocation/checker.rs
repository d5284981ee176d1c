//! Chain-level revocation checking
//!
//! Every presented certificate on a validated path (the anchor excepted) is
//! looked up concurrently. A revoked certificate anywhere denies the chain;
//! otherwise `unknown` answers and source failures are handled by the
//! [`FailPolicy`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cache::{RevocationCache, spawn_cleanup_task};
use super::crl::CrlSource;
use super::responder::ResponderSource;
use super::retry::{RetryPolicy, with_retry};
use super::{
    RevocationKey, RevocationQuery, RevocationRecord, RevocationSource, RevocationStatus,
};
use crate::cert::ValidatedChain;
use crate::config::{FailPolicy, RevocationConfig, RevocationMode};
use crate::error::AuthError;
use crate::{Error, Result};

/// Revocation checker shared by all connection attempts
pub struct RevocationChecker {
    source: Option<Arc<dyn RevocationSource>>,
    cache: Arc<RevocationCache>,
    fail_policy: FailPolicy,
    cache_ttl: Duration,
    unknown_ttl: Duration,
    cleanup_interval: Duration,
    retry: RetryPolicy,
}

impl RevocationChecker {
    /// Build the checker described by `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configured source cannot be constructed.
    pub fn from_config(config: &RevocationConfig) -> Result<Self> {
        let source: Option<Arc<dyn RevocationSource>> = match config.mode {
            RevocationMode::Disabled => None,
            RevocationMode::Crl => Some(Arc::new(CrlSource::new(
                config.crl_files.clone(),
                config.crl_urls.clone(),
                config.use_distribution_points,
                config.query_timeout,
            )?)),
            RevocationMode::Ocsp => {
                let url = config.responder_url.clone().ok_or_else(|| {
                    Error::Config("revocation.responder_url is required in ocsp mode".into())
                })?;
                Some(Arc::new(ResponderSource::new(url, config.query_timeout)?))
            }
        };

        Ok(Self::build(source, config))
    }

    /// Checker over a caller-supplied source
    #[must_use]
    pub fn with_source(source: Arc<dyn RevocationSource>, config: &RevocationConfig) -> Self {
        Self::build(Some(source), config)
    }

    /// Checker that treats every chain as good
    #[must_use]
    pub fn disabled() -> Self {
        Self::build(None, &RevocationConfig::default())
    }

    fn build(source: Option<Arc<dyn RevocationSource>>, config: &RevocationConfig) -> Self {
        Self {
            source,
            cache: Arc::new(RevocationCache::new()),
            fail_policy: config.fail_policy,
            cache_ttl: config.cache_ttl(),
            unknown_ttl: config.unknown_ttl,
            cleanup_interval: config.cleanup_interval,
            retry: RetryPolicy::new(&config.retry, config.query_timeout),
        }
    }

    /// Share an existing cache (e.g. across checkers rebuilt on reconfiguration)
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<RevocationCache>) -> Self {
        self.cache = cache;
        self
    }

    /// The status cache
    pub fn cache(&self) -> &Arc<RevocationCache> {
        &self.cache
    }

    /// Start sweeping expired cache records every `cleanup_interval`.
    ///
    /// Records are otherwise only dropped when their own key is looked up
    /// again, so long-running brokers should call this once at startup.
    pub fn spawn_cleanup(&self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        spawn_cleanup_task(&self.cache, self.cleanup_interval, shutdown_rx)
    }

    /// Whether lookups are performed at all
    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    /// Fail policy in effect
    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// Check every presented certificate of `chain`
    ///
    /// # Errors
    ///
    /// `RevocationStatusRevoked` for the lowest revoked position, otherwise
    /// `RevocationCheckFailed` for the lowest undetermined position when the
    /// policy is fail-closed.
    pub async fn check(&self, chain: &ValidatedChain) -> std::result::Result<(), AuthError> {
        let Some(source) = &self.source else {
            return Ok(());
        };

        let positions = checked_positions(chain);
        let lookups = positions.clone().filter_map(|position| {
            let issuer = chain.issuer_of(position)?;
            let query = RevocationQuery {
                certificate: &chain.certificates()[position],
                issuer,
            };
            Some(async move { (position, self.status(source.as_ref(), query).await) })
        });
        let results = join_all(lookups).await;

        if let Some((position, record)) = results.iter().find_map(|(position, result)| match result {
            Ok(record) if matches!(record.status, RevocationStatus::Revoked { .. }) => {
                Some((*position, record))
            }
            _ => None,
        }) {
            let reason = match &record.status {
                RevocationStatus::Revoked { reason } => reason.clone(),
                _ => String::new(),
            };
            return Err(AuthError::RevocationStatusRevoked {
                position,
                serial: record.serial.clone(),
                reason,
            });
        }

        for (position, result) in results {
            let detail = match result {
                Ok(record) if record.status == RevocationStatus::Good => continue,
                Ok(_) => "revocation status unknown".to_string(),
                Err(e) => e.to_string(),
            };

            match self.fail_policy {
                FailPolicy::Closed => {
                    return Err(AuthError::RevocationCheckFailed { position, detail });
                }
                FailPolicy::Open => {
                    warn!(
                        position,
                        subject = %chain.certificates()[position].subject(),
                        detail = %detail,
                        "Revocation status undetermined, allowing under fail-open policy"
                    );
                }
            }
        }

        debug!(checked = positions.len(), "Revocation check passed");
        Ok(())
    }

    /// Status of one certificate through the cache
    ///
    /// # Errors
    ///
    /// Returns the source error once retries are exhausted.
    pub async fn status(
        &self,
        source: &dyn RevocationSource,
        query: RevocationQuery<'_>,
    ) -> Result<RevocationRecord> {
        let key = RevocationKey::of(query.certificate);

        self.cache
            .get_or_resolve(&key, || async {
                let result = with_retry(&self.retry, source.name(), || source.query(query)).await;

                let answer = match result {
                    Ok(answer) => answer,
                    Err(e) => {
                        record_query("error");
                        return Err(e);
                    }
                };
                record_query(answer.status.label());

                let ceiling = match answer.status {
                    RevocationStatus::Unknown => self.unknown_ttl,
                    _ => self.cache_ttl,
                };
                let ttl = answer.ttl_hint.map_or(ceiling, |hint| hint.min(ceiling));

                debug!(
                    source = source.name(),
                    serial = query.certificate.serial_hex(),
                    status = %answer.status,
                    ttl_secs = ttl.as_secs(),
                    "Revocation status resolved"
                );

                Ok(RevocationRecord {
                    issuer: query.certificate.issuer().to_string(),
                    serial: query.certificate.serial_hex().to_string(),
                    status: answer.status,
                    checked_at: OffsetDateTime::now_utc(),
                    ttl,
                })
            })
            .await
    }
}

/// Positions whose status must be known: every presented certificate except
/// a presented anchor.
fn checked_positions(chain: &ValidatedChain) -> std::ops::Range<usize> {
    let presented = chain.certificates().len();
    if chain.anchor_presented() {
        0..presented - 1
    } else {
        0..presented
    }
}

fn record_query(result: &'static str) {
    telemetry_metrics::counter!("x509_auth_revocation_queries_total", "result" => result)
        .increment(1);
}
