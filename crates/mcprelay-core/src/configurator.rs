//! Configuration reading and watching
//!
//! A `Configurator` yields an initial snapshot, an optional stream of
//! subsequent snapshots, and a stop function releasing watcher resources.
//! Reload failures never tear down the gateway: the watcher logs the error
//! and keeps the previous snapshot in effect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Configuration, GlobalOptions, SecretMap, ServerSpec, SharedConfiguration};
use crate::error::CoreError;

/// Debounce window for filesystem events before re-reading.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Releases watcher resources. Safe to call once; dropping the handle
/// without calling it stops the watcher as well.
pub type StopFn = Box<dyn FnOnce() + Send>;

/// Result of one configurator read.
pub struct ConfigHandle {
    /// Initial snapshot.
    pub snapshot: SharedConfiguration,
    /// Subsequent snapshots; `None` when watching is disabled.
    pub updates: Option<mpsc::Receiver<SharedConfiguration>>,
    stop: Option<StopFn>,
}

impl ConfigHandle {
    pub fn new(
        snapshot: SharedConfiguration,
        updates: Option<mpsc::Receiver<SharedConfiguration>>,
        stop: Option<StopFn>,
    ) -> Self {
        Self {
            snapshot,
            updates,
            stop,
        }
    }

    /// Stop the watcher, if one is running.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for ConfigHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Yields configuration snapshots.
#[async_trait]
pub trait Configurator: Send + Sync {
    async fn read(&self, cancel: CancellationToken) -> Result<ConfigHandle, CoreError>;
}

/// On-disk configuration file shape.
///
/// Servers are an ordered JSON object; object order is the stable
/// configuration order used for collision tie-breaking.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    servers: serde_json::Map<String, serde_json::Value>,
    secrets: HashMap<String, SecretMap>,
    options: GlobalOptions,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            servers: serde_json::Map::new(),
            secrets: HashMap::new(),
            options: GlobalOptions::default(),
        }
    }
}

/// Parse a configuration file into a snapshot.
pub fn load_configuration(path: &Path) -> Result<Configuration, CoreError> {
    let raw = std::fs::read_to_string(path)?;
    let file: ConfigFile = serde_json::from_str(&raw)?;

    let mut specs = Vec::with_capacity(file.servers.len());
    for (name, value) in file.servers {
        let mut obj = value
            .as_object()
            .cloned()
            .ok_or_else(|| CoreError::Config(format!("server '{name}' is not an object")))?;
        obj.insert("name".to_string(), serde_json::Value::String(name.clone()));

        let spec: ServerSpec = serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| CoreError::Config(format!("server '{name}': {e}")))?;
        spec.validate().map_err(CoreError::Config)?;
        specs.push(spec);
    }

    Ok(Configuration::new(specs, file.secrets, file.options))
}

/// File-backed configurator with optional watching.
pub struct FileConfigurator {
    path: PathBuf,
    watch: bool,
}

impl FileConfigurator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watch: false,
        }
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

#[async_trait]
impl Configurator for FileConfigurator {
    async fn read(&self, cancel: CancellationToken) -> Result<ConfigHandle, CoreError> {
        let snapshot = Arc::new(load_configuration(&self.path)?);
        info!(
            path = %self.path.display(),
            servers = snapshot.server_names().len(),
            "[Config] Loaded configuration"
        );

        if !self.watch {
            return Ok(ConfigHandle::new(snapshot, None, None));
        }

        let (update_tx, update_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(32);

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = event_tx.blocking_send(());
                    }
                }
            })
            .map_err(|e| CoreError::Config(format!("failed to create watcher: {e}")))?;

        // Watch the parent directory: editors replace files atomically, which
        // unregisters a path-level watch.
        let watch_root = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_root, RecursiveMode::NonRecursive)
            .map_err(|e| CoreError::Config(format!("failed to watch {}: {e}", watch_root.display())))?;

        let watch_cancel = cancel.child_token();
        let stop_cancel = watch_cancel.clone();
        let path = self.path.clone();
        tokio::spawn(watch_loop(path, watcher, event_rx, update_tx, watch_cancel));

        let stop: StopFn = Box::new(move || stop_cancel.cancel());
        Ok(ConfigHandle::new(snapshot, Some(update_rx), Some(stop)))
    }
}

/// Long-lived watch task: debounce change bursts, re-read, publish.
async fn watch_loop(
    path: PathBuf,
    _watcher: RecommendedWatcher,
    mut events: mpsc::Receiver<()>,
    updates: mpsc::Sender<SharedConfiguration>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("[Config] Watcher stopped");
                return;
            }
            event = events.recv() => {
                if event.is_none() {
                    return;
                }
                // Collapse bursts of events from a single save
                tokio::time::sleep(WATCH_DEBOUNCE).await;
                while events.try_recv().is_ok() {}

                match load_configuration(&path) {
                    Ok(config) => {
                        info!(
                            servers = config.server_names().len(),
                            "[Config] Reloaded configuration"
                        );
                        if updates.send(Arc::new(config)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // Previous snapshot stays in effect
                        warn!(error = %e, "[Config] Reload failed, keeping previous snapshot");
                    }
                }
            }
        }
    }
}
