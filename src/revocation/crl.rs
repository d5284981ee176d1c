//! CRL-backed revocation source
//!
//! CRLs come from three places, all optional:
//!
//! - local files (PEM bundles or DER), loaded at construction and on
//!   [`CrlSource::reload_files`]
//! - configured HTTP URLs
//! - the HTTP distribution points named in the certificate being checked
//!
//! Fetched CRLs are kept per URL until their `nextUpdate` (or
//! [`FETCH_REFRESH`] when they carry none).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::x509::ReasonCode;

use super::{RevocationQuery, RevocationSource, RevocationStatus, SourceAnswer, normalize_serial};
use crate::cert::Certificate;
use crate::{Error, Result};

/// How long a fetched CRL without `nextUpdate` is reused
pub const FETCH_REFRESH: Duration = Duration::from_secs(3600);

/// An owned, decoded CRL
struct LoadedCrl {
    origin: String,
    der: Vec<u8>,
    issuer: Vec<u8>,
    this_update: OffsetDateTime,
    next_update: Option<OffsetDateTime>,
    revoked: HashMap<Vec<u8>, String>,
    fetched_at: Instant,
    verified_by: Mutex<HashSet<String>>,
}

impl LoadedCrl {
    fn decode(origin: &str, der: &[u8]) -> Result<Self> {
        let (_, crl) = CertificateRevocationList::from_der(der)
            .map_err(|e| Error::RevocationData(format!("invalid CRL from {origin}: {e}")))?;

        let revoked = crl
            .iter_revoked_certificates()
            .map(|entry| {
                let reason = entry
                    .reason_code()
                    .map_or("unspecified", |(_, code)| format_crl_reason(code));
                (
                    normalize_serial(entry.raw_serial()).to_vec(),
                    reason.to_string(),
                )
            })
            .collect();

        Ok(Self {
            origin: origin.to_string(),
            der: der.to_vec(),
            issuer: crl.issuer().as_raw().to_vec(),
            this_update: crl.last_update().to_datetime(),
            next_update: crl.next_update().map(|t| t.to_datetime()),
            revoked,
            fetched_at: Instant::now(),
            verified_by: Mutex::new(HashSet::new()),
        })
    }

    /// Decode every CRL in a PEM bundle, or `data` itself as DER.
    fn decode_all(origin: &str, data: &[u8]) -> Result<Vec<Self>> {
        let ders = rustls_pemfile::crls(&mut &data[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::RevocationData(format!("invalid CRL PEM from {origin}: {e}")))?;

        if ders.is_empty() {
            return Ok(vec![Self::decode(origin, data)?]);
        }
        ders.iter()
            .map(|der| Self::decode(origin, der.as_ref()))
            .collect()
    }

    fn is_stale(&self, now: OffsetDateTime) -> bool {
        self.next_update.is_some_and(|next| now >= next)
    }

    fn needs_refetch(&self, now: OffsetDateTime) -> bool {
        match self.next_update {
            Some(_) => self.is_stale(now),
            None => self.fetched_at.elapsed() > FETCH_REFRESH,
        }
    }

    fn verify(&self, issuer: &Certificate) -> Result<()> {
        if self.verified_by.lock().contains(issuer.fingerprint()) {
            return Ok(());
        }

        let (_, crl) = CertificateRevocationList::from_der(&self.der)
            .map_err(|e| Error::RevocationData(format!("invalid CRL from {}: {e}", self.origin)))?;
        let (_, issuer_x509) = X509Certificate::from_der(issuer.der())
            .map_err(|e| Error::RevocationData(format!("cannot decode CRL issuer: {e}")))?;

        crl.verify_signature(issuer_x509.public_key()).map_err(|e| {
            Error::RevocationData(format!(
                "CRL from {} is not signed by '{}': {e}",
                self.origin,
                issuer.subject()
            ))
        })?;

        self.verified_by
            .lock()
            .insert(issuer.fingerprint().to_owned());
        Ok(())
    }
}

/// RFC 5280 name for a CRL reason code
fn format_crl_reason(code: ReasonCode) -> &'static str {
    match code.0 {
        1 => "keyCompromise",
        2 => "cACompromise",
        3 => "affiliationChanged",
        4 => "superseded",
        5 => "cessationOfOperation",
        6 => "certificateHold",
        8 => "removeFromCRL",
        9 => "privilegeWithdrawn",
        10 => "aACompromise",
        _ => "unspecified",
    }
}

/// Revocation source answering from CRLs
pub struct CrlSource {
    files: Vec<PathBuf>,
    urls: Vec<String>,
    use_distribution_points: bool,
    client: Client,
    local: RwLock<Vec<Arc<LoadedCrl>>>,
    fetched: DashMap<String, Vec<Arc<LoadedCrl>>>,
}

impl CrlSource {
    /// Create a source and load the local CRL files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or decoded, or the HTTP
    /// client cannot be built.
    pub fn new(
        files: Vec<PathBuf>,
        urls: Vec<String>,
        use_distribution_points: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create CRL HTTP client: {e}")))?;

        let source = Self {
            files,
            urls,
            use_distribution_points,
            client,
            local: RwLock::new(Vec::new()),
            fetched: DashMap::new(),
        };
        source.reload_files()?;
        Ok(source)
    }

    /// Re-read the local CRL files. On error the previous set stays active.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or decoded.
    pub fn reload_files(&self) -> Result<usize> {
        let mut loaded = Vec::new();
        for path in &self.files {
            let origin = path.display().to_string();
            let data = std::fs::read(path)
                .map_err(|e| Error::Config(format!("Cannot read CRL '{origin}': {e}")))?;
            loaded.extend(LoadedCrl::decode_all(&origin, &data)?.into_iter().map(Arc::new));
        }

        let count = loaded.len();
        *self.local.write() = loaded;
        if count > 0 {
            info!(crls = count, "Loaded local CRLs");
        }
        Ok(count)
    }

    async fn fetch(&self, url: &str, now: OffsetDateTime) -> Result<Vec<Arc<LoadedCrl>>> {
        if let Some(cached) = self.fetched.get(url) {
            if !cached.iter().any(|crl| crl.needs_refetch(now)) {
                return Ok(cached.value().clone());
            }
        }

        debug!(url, "Fetching CRL");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Revocation(format!("CRL fetch from {url} returned {status}")));
        }
        let body = response.bytes().await?;

        let crls: Vec<Arc<LoadedCrl>> = LoadedCrl::decode_all(url, &body)?
            .into_iter()
            .map(Arc::new)
            .collect();
        self.fetched.insert(url.to_string(), crls.clone());
        Ok(crls)
    }

    fn remote_urls<'a>(&'a self, certificate: &'a Certificate) -> impl Iterator<Item = &'a str> {
        let points: &[String] = if self.use_distribution_points {
            certificate.crl_distribution_points()
        } else {
            &[]
        };
        self.urls
            .iter()
            .map(String::as_str)
            .chain(
                points
                    .iter()
                    .map(String::as_str)
                    .filter(|uri| uri.starts_with("http://") || uri.starts_with("https://")),
            )
    }
}

#[async_trait]
impl RevocationSource for CrlSource {
    fn name(&self) -> &'static str {
        "crl"
    }

    async fn query(&self, query: RevocationQuery<'_>) -> Result<SourceAnswer> {
        let issuer = query.certificate.issuer().as_raw();
        let now = OffsetDateTime::now_utc();

        let mut candidates: Vec<Arc<LoadedCrl>> = self
            .local
            .read()
            .iter()
            .filter(|crl| crl.issuer == issuer)
            .cloned()
            .collect();

        let mut fetch_error = None;
        for url in self.remote_urls(query.certificate) {
            match self.fetch(url, now).await {
                Ok(crls) => candidates.extend(crls.into_iter().filter(|crl| crl.issuer == issuer)),
                Err(e) => {
                    warn!(url, error = %e, "CRL fetch failed");
                    fetch_error.get_or_insert(e);
                }
            }
        }

        // Newest CRL for this issuer wins.
        let Some(crl) = candidates.into_iter().max_by_key(|crl| crl.this_update) else {
            return match fetch_error {
                Some(e) => Err(e),
                None => {
                    debug!(issuer = %query.certificate.issuer(), "No CRL covers issuer");
                    Ok(SourceAnswer::new(RevocationStatus::Unknown))
                }
            };
        };

        crl.verify(query.issuer)?;

        if now < crl.this_update || crl.is_stale(now) {
            warn!(origin = %crl.origin, "CRL is outside its validity window");
            return Ok(SourceAnswer::new(RevocationStatus::Unknown));
        }

        let status = match crl.revoked.get(normalize_serial(query.certificate.serial())) {
            Some(reason) => RevocationStatus::Revoked {
                reason: reason.clone(),
            },
            None => RevocationStatus::Good,
        };

        let ttl_hint = crl
            .next_update
            .and_then(|next| Duration::try_from(next - now).ok());

        Ok(SourceAnswer { status, ttl_hint })
    }
}
