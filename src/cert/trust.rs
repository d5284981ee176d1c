//! Trust anchors and the hot-swappable trust store.
//!
//! A [`TrustAnchorSet`] is an immutable snapshot. The [`TrustStore`] holds the
//! current snapshot behind a pointer swap, so an in-flight validation keeps
//! whatever snapshot it started with while a reload installs a new one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cert::parser::{Certificate, DistinguishedName};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable set of trusted root (or pinned intermediate) certificates.
#[derive(Debug)]
pub struct TrustAnchorSet {
    anchors: Vec<Certificate>,
    by_subject: HashMap<Vec<u8>, Vec<usize>>,
    by_fingerprint: HashMap<String, usize>,
    loaded_at: OffsetDateTime,
}

impl TrustAnchorSet {
    /// Build a set from parsed certificates. Duplicates are collapsed.
    ///
    /// # Errors
    ///
    /// Returns `Error::TrustStore` if `anchors` is empty.
    pub fn from_certificates(anchors: Vec<Certificate>) -> Result<Self> {
        if anchors.is_empty() {
            return Err(Error::TrustStore("trust anchor set is empty".to_string()));
        }

        let mut unique = Vec::with_capacity(anchors.len());
        let mut by_subject: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
        let mut by_fingerprint = HashMap::new();

        for anchor in anchors {
            if by_fingerprint.contains_key(anchor.fingerprint()) {
                continue;
            }
            let idx = unique.len();
            by_fingerprint.insert(anchor.fingerprint().to_owned(), idx);
            by_subject
                .entry(anchor.subject().as_raw().to_vec())
                .or_default()
                .push(idx);
            unique.push(anchor);
        }

        Ok(Self {
            anchors: unique,
            by_subject,
            by_fingerprint,
            loaded_at: OffsetDateTime::now_utc(),
        })
    }

    /// Load anchors from a PEM/DER file or a directory of such files.
    ///
    /// Directory entries are read in name order; files with extensions other
    /// than `pem`, `crt`, `cer` and `der` are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be read, a file cannot be parsed,
    /// or no certificates are found.
    pub fn load(path: &Path) -> Result<Self> {
        let mut anchors = Vec::new();

        if path.is_dir() {
            let mut entries: Vec<PathBuf> = fs::read_dir(path)
                .map_err(|e| {
                    Error::TrustStore(format!("Cannot read '{}': {e}", path.display()))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_certificate_extension(p))
                .collect();
            entries.sort();

            for entry in entries {
                anchors.extend(load_certificate_file(&entry)?);
            }
        } else {
            anchors = load_certificate_file(path)?;
        }

        if anchors.is_empty() {
            return Err(Error::TrustStore(format!(
                "No trust anchors found in '{}'",
                path.display()
            )));
        }

        debug!(path = %path.display(), count = anchors.len(), "Loaded trust anchors");
        Self::from_certificates(anchors)
    }

    /// Whether `cert` is byte-identical to an anchor.
    pub fn contains(&self, cert: &Certificate) -> bool {
        self.by_fingerprint
            .get(cert.fingerprint())
            .is_some_and(|idx| self.anchors[*idx] == *cert)
    }

    /// Anchors whose subject equals `name`.
    pub fn find_by_subject<'a>(
        &'a self,
        name: &DistinguishedName,
    ) -> impl Iterator<Item = &'a Certificate> + 'a {
        self.by_subject
            .get(name.as_raw())
            .into_iter()
            .flatten()
            .map(|idx| &self.anchors[*idx])
    }

    /// All anchors.
    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.anchors.iter()
    }

    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Always `false` for a constructed set.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// When this snapshot was built.
    pub fn loaded_at(&self) -> OffsetDateTime {
        self.loaded_at
    }
}

fn has_certificate_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "pem" | "crt" | "cer" | "der"))
}

/// Read every certificate from a PEM bundle or a single DER file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a certificate cannot be
/// parsed.
pub fn load_certificate_file(path: &Path) -> Result<Vec<Certificate>> {
    let data = fs::read(path)
        .map_err(|e| Error::TrustStore(format!("Cannot read '{}': {e}", path.display())))?;

    let ders = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::TrustStore(format!("Failed to parse certs from '{}': {e}", path.display()))
        })?;

    if ders.is_empty() && data.first() == Some(&0x30) {
        return Ok(vec![Certificate::from_der(&data)?]);
    }

    ders.iter()
        .map(|der| Certificate::from_der(der))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| Error::TrustStore(format!("'{}': {e}", path.display())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Live store
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide trust anchors with atomic snapshot replacement.
///
/// Readers clone the inner `Arc`; writers swap the whole `Arc`, so a reader
/// never observes a partially loaded set.
pub struct TrustStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<TrustAnchorSet>>,
    generation: AtomicU64,
}

impl TrustStore {
    /// Wrap an in-memory snapshot. [`TrustStore::reload`] is unavailable.
    #[must_use]
    pub fn new(anchors: TrustAnchorSet) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(anchors)),
            generation: AtomicU64::new(1),
        }
    }

    /// Load from `path` and remember it for later reloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load fails.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let anchors = TrustAnchorSet::load(&path)?;
        info!(path = %path.display(), anchors = anchors.len(), "Trust store loaded");
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(anchors)),
            generation: AtomicU64::new(1),
        })
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TrustAnchorSet> {
        Arc::clone(&self.current.read())
    }

    /// Atomically install a new snapshot.
    pub fn replace(&self, anchors: TrustAnchorSet) {
        *self.current.write() = Arc::new(anchors);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-read the configured path and swap in the result.
    ///
    /// On failure the previous snapshot remains active.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured or the load fails.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Err(Error::TrustStore(
                "trust store was not loaded from a path".to_string(),
            ));
        };

        match TrustAnchorSet::load(path) {
            Ok(anchors) => {
                let count = anchors.len();
                self.replace(anchors);
                info!(path = %path.display(), anchors = count, "Trust store reloaded");
                Ok(count)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Trust store reload failed, keeping current anchors");
                Err(e)
            }
        }
    }

    /// Source path, if loaded from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of snapshots installed so far (starts at 1).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generator::{CaParams, CertGenerator};

    fn root(cn: &str) -> crate::cert::IssuedCert {
        CertGenerator::root(&CaParams::named(cn)).unwrap()
    }

    #[test]
    fn empty_set_is_rejected() {
        assert!(TrustAnchorSet::from_certificates(Vec::new()).is_err());
    }

    #[test]
    fn duplicates_collapse() {
        let ca = root("RootCA");
        let cert = Certificate::from_der(ca.der()).unwrap();
        let set = TrustAnchorSet::from_certificates(vec![cert.clone(), cert.clone()]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&cert));
    }

    #[test]
    fn find_by_subject_matches_encoded_name() {
        let ca = root("RootCA");
        let other = root("OtherCA");
        let cert = Certificate::from_der(ca.der()).unwrap();
        let set = TrustAnchorSet::from_certificates(vec![
            cert.clone(),
            Certificate::from_der(other.der()).unwrap(),
        ])
        .unwrap();

        let found: Vec<_> = set.find_by_subject(cert.subject()).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], &cert);
    }

    #[test]
    fn load_pem_bundle_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.pem");
        fs::write(&path, format!("{}{}", root("A").pem(), root("B").pem())).unwrap();

        let set = TrustAnchorSet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn load_directory_reads_pem_and_der_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pem"), root("A").pem()).unwrap();
        fs::write(dir.path().join("b.der"), root("B").der()).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let set = TrustAnchorSet::load(dir.path()).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn load_missing_file_fails() {
        let err = TrustAnchorSet::load(Path::new("/nonexistent/anchors.pem")).unwrap_err();
        assert!(err.to_string().contains("Cannot read"));
    }

    #[test]
    fn load_file_without_certificates_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, b"").unwrap();
        assert!(TrustAnchorSet::load(&path).is_err());
    }

    #[test]
    fn reload_swaps_snapshot_and_keeps_old_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.pem");
        fs::write(&path, root("A").pem()).unwrap();

        let store = TrustStore::load(&path).unwrap();
        let before = store.snapshot();
        assert_eq!(before.len(), 1);
        assert_eq!(store.generation(), 1);

        fs::write(&path, format!("{}{}", root("A2").pem(), root("B").pem())).unwrap();
        assert_eq!(store.reload().unwrap(), 2);
        assert_eq!(store.snapshot().len(), 2);
        assert_eq!(store.generation(), 2);
        // An earlier snapshot is unaffected by the swap.
        assert_eq!(before.len(), 1);

        fs::write(&path, b"garbage").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().len(), 2);
        assert_eq!(store.generation(), 2);
    }

    #[test]
    fn in_memory_store_cannot_reload() {
        let cert = Certificate::from_der(root("A").der()).unwrap();
        let store = TrustStore::new(TrustAnchorSet::from_certificates(vec![cert]).unwrap());
        assert!(store.reload().is_err());
        assert!(store.path().is_none());
    }
}
