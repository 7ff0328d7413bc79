//! File watcher for the gateway config and the catalog.
//!
//! Watches a file for changes, debounces rapid modifications, and reloads.
//! A file that fails to load is rejected and the last good value is kept.
//! Each successful reload is published on a `watch` channel; for the catalog
//! that publication is the invalidation signal the gateway recompiles on.
//!
//! Requires the `config-watch` feature.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use switchyard_model::Catalog;
use tokio::sync::watch;

use crate::{load_catalog, ConfigError, GatewayConfig};

/// Debounce interval for rapid file changes.
const DEBOUNCE_MS: u64 = 200;

/// A value that can be (re)loaded from a file.
pub trait Reloadable: Sized + Send + Sync + 'static {
    /// Load a fresh value from `path`.
    fn load(path: &Path) -> Result<Self, ConfigError>;
}

impl Reloadable for GatewayConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        GatewayConfig::from_file_with_env(path)
    }
}

impl Reloadable for Catalog {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        load_catalog(path)
    }
}

/// A file watcher that reloads on changes.
pub struct ConfigWatcher<T: Reloadable> {
    path: PathBuf,
    tx: watch::Sender<Arc<T>>,
    rx: watch::Receiver<Arc<T>>,
}

impl<T: Reloadable> ConfigWatcher<T> {
    /// Create a watcher, loading the initial value from the file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let value = T::load(&path)?;
        let (tx, rx) = watch::channel(Arc::new(value));
        Ok(Self { path, tx, rx })
    }

    /// Get a receiver that yields the latest value on each change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.rx.clone()
    }

    /// Get the current value.
    pub fn current(&self) -> Arc<T> {
        self.rx.borrow().clone()
    }

    /// Start watching. The background task runs until the file becomes
    /// unwatchable or the task is aborted.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.watch_loop().await {
                tracing::error!("file watcher stopped: {}", e);
            }
        })
    }

    async fn watch_loop(&self) -> Result<(), ConfigError> {
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let _ = notify_tx.blocking_send(());
                    }
                }
            })
            .map_err(|e| ConfigError::Invalid(format!("failed to create watcher: {}", e)))?;

        // Watch the parent directory; editors often save via rename.
        let watch_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Invalid(format!("failed to watch directory: {}", e)))?;

        tracing::info!(path = %self.path.display(), "watching file");

        loop {
            if notify_rx.recv().await.is_none() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
            while notify_rx.try_recv().is_ok() {}

            match T::load(&self.path) {
                Ok(value) => {
                    tracing::info!(path = %self.path.display(), "reloaded");
                    let _ = self.tx.send(Arc::new(value));
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "reload failed, keeping previous value"
                    );
                }
            }
        }

        Ok(())
    }
}
