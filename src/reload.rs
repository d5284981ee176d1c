//! Trust-anchor hot reload.
//!
//! Watches the configured trust-anchor file (or directory) and calls
//! [`TrustStore::reload`] once file events settle. A failed reload leaves the
//! previous anchors active; the error is logged by the store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//! use broker_x509_auth::cert::TrustStore;
//! use broker_x509_auth::reload::TrustAnchorWatcher;
//!
//! # tokio_test::block_on(async {
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let store = Arc::new(TrustStore::load("/etc/broker/ca.pem").unwrap());
//! let _watcher = TrustAnchorWatcher::start(store, shutdown_tx.subscribe()).unwrap();
//! # });
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::cert::TrustStore;
use crate::config::Config;
use crate::{Error, Result};

/// Quiet period after the last file event before reloading
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Background watcher; dropping it stops OS notifications
pub struct TrustAnchorWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
    path: PathBuf,
}

impl TrustAnchorWatcher {
    /// Start watching the path `store` was loaded from.
    ///
    /// The reload task runs until `shutdown_rx` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the store has no path or the OS watcher cannot be
    /// created.
    pub fn start(store: Arc<TrustStore>, shutdown_rx: broadcast::Receiver<()>) -> Result<Self> {
        let path = store
            .path()
            .ok_or_else(|| Error::TrustStore("trust store was not loaded from a path".into()))?
            .to_path_buf();

        let (event_tx, event_rx) = mpsc::channel(32);
        let watcher = create_notify_watcher(event_tx, &path)?;
        spawn_reload_task(store, event_rx, shutdown_rx);

        info!(path = %path.display(), "Watching trust anchors for changes");
        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
            path,
        })
    }

    /// Start a watcher when `config.watch_trust_anchors` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if watching was requested but cannot be started.
    pub fn from_config(
        config: &Config,
        store: Arc<TrustStore>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Option<Self>> {
        if !config.watch_trust_anchors {
            debug!("Trust anchor watching disabled");
            return Ok(None);
        }
        Self::start(store, shutdown_rx).map(Some)
    }

    /// Watched path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn create_notify_watcher(event_tx: mpsc::Sender<()>, path: &Path) -> Result<RecommendedWatcher> {
    // Watch the parent of a file so editors that replace via rename are seen.
    let watch_dir = if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf()
    };
    let target = path.to_path_buf();

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            if result.as_ref().is_ok_and(|e| is_anchor_event(e, &target)) {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Internal(format!("Failed to create trust anchor watcher: {e}")))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Internal(format!("Failed to watch trust anchor path: {e}")))?;

    Ok(watcher)
}

fn spawn_reload_task(
    store: Arc<TrustStore>,
    mut event_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut last_event: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {
                    last_event = Some(Instant::now());
                }
                _ = ticker.tick() => {
                    if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                        last_event = None;
                        // Failures are logged by the store and keep the old snapshot.
                        if let Ok(count) = store.reload() {
                            debug!(anchors = count, generation = store.generation(), "Trust anchors swapped");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Trust anchor watcher shutting down");
                    break;
                }
            }
        }
    });
}

/// Create, modify or remove events touching the watched file, or anything
/// inside a watched directory.
fn is_anchor_event(event: &Event, path: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p == path || p.parent() == Some(path))
}
