//! Hot reload: filesystem watching with per-path debounce.
//!
//! Editors and build tools emit bursts of events per save; each path gets
//! its own debounce timer, reset on every new event, and the final fire
//! performs the action. Classification happens at fire time from what is
//! actually on disk, so a rename behaves as a remove of the old path and a
//! create of the new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trellis_core::Result;

use crate::loader::{DESCRIPTOR_FILE, DescriptorRuntime, Discovery, DiscoveryKind, PluginLoader, parse_descriptor};

/// Default quiet period before a changed path is acted on.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

type Timers = Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>;
type SharedWatcher = Arc<Mutex<Option<RecommendedWatcher>>>;

/// Watches the plugin root and known subdirectories, driving the loader.
pub struct HotReloadWatcher {
    watcher: SharedWatcher,
    process_task: JoinHandle<()>,
    timers: Timers,
}

impl HotReloadWatcher {
    /// Start watching `loader`'s root with the default debounce.
    ///
    /// # Errors
    ///
    /// Fails when the filesystem watcher cannot be created or attached.
    pub fn start(loader: Arc<PluginLoader>) -> Result<Self> {
        Self::start_with_debounce(loader, DEFAULT_DEBOUNCE)
    }

    /// Start watching with an explicit debounce window.
    ///
    /// # Errors
    ///
    /// As [`Self::start`].
    pub fn start_with_debounce(loader: Arc<PluginLoader>, debounce: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<PathBuf>();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = result else { return };
                // Only mutations matter; reads and metadata chatter do not.
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    raw_tx.send(path).ok();
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| trellis_core::Error::internal(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(loader.root(), RecursiveMode::NonRecursive)
            .map_err(|e| {
                trellis_core::Error::internal(format!(
                    "failed to watch {}: {e}",
                    loader.root().display()
                ))
            })?;
        for discovery in loader.discoveries() {
            if discovery.kind == DiscoveryKind::Rpc {
                watcher
                    .watch(&discovery.path, RecursiveMode::NonRecursive)
                    .ok();
            }
        }

        let watcher: SharedWatcher = Arc::new(Mutex::new(Some(watcher)));

        // Bridge the blocking notify channel into the async world.
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            while let Ok(path) = raw_rx.recv() {
                if event_tx.send(path).is_err() {
                    break;
                }
            }
        });

        let timers: Timers = Arc::new(Mutex::new(HashMap::new()));
        let process_task = tokio::spawn(Self::process_events(
            loader,
            Arc::clone(&watcher),
            Arc::clone(&timers),
            event_rx,
            debounce,
        ));

        tracing::info!("hot reload watcher started");
        Ok(Self {
            watcher,
            process_task,
            timers,
        })
    }

    /// Stop watching; pending debounce timers are cancelled.
    pub fn stop(&self) {
        self.watcher.lock().take();
        self.process_task.abort();
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
        tracing::info!("hot reload watcher stopped");
    }

    async fn process_events(
        loader: Arc<PluginLoader>,
        watcher: SharedWatcher,
        timers: Timers,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        debounce: Duration,
    ) {
        while let Some(path) = events.recv().await {
            let mut timers_guard = timers.lock();
            // A fresh event restarts the quiet period for this path.
            if let Some(previous) = timers_guard.remove(&path) {
                previous.abort();
            }
            let timer = tokio::spawn({
                let loader = Arc::clone(&loader);
                let watcher = Arc::clone(&watcher);
                let timers = Arc::clone(&timers);
                let path = path.clone();
                async move {
                    tokio::time::sleep(debounce).await;
                    timers.lock().remove(&path);
                    act(&loader, &watcher, &path).await;
                }
            });
            timers_guard.insert(path, timer);
        }
    }
}

impl Drop for HotReloadWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Perform the debounced action for one settled path.
async fn act(loader: &Arc<PluginLoader>, watcher: &SharedWatcher, path: &Path) {
    let root = loader.root();

    let is_descriptor = path.file_name().is_some_and(|n| n == DESCRIPTOR_FILE)
        && path
            .parent()
            .and_then(Path::parent)
            .is_some_and(|grandparent| grandparent == root);
    let is_wasm = path.extension().is_some_and(|ext| ext == "wasm")
        && path.parent().is_some_and(|parent| parent == root);

    if is_descriptor {
        act_descriptor(loader, watcher, path).await;
    } else if is_wasm {
        act_wasm(loader, path).await;
    } else if let Some(name) = loader.find_by_binary(path) {
        act_binary(loader, &name, path).await;
    }
}

async fn act_descriptor(loader: &Arc<PluginLoader>, watcher: &SharedWatcher, path: &Path) {
    let Some(dir) = path.parent() else { return };

    if !path.exists() {
        if let Some(name) = loader.find_by_dir(dir) {
            tracing::info!(plugin = %name, "descriptor removed; unregistering");
            loader.remove(&name).await;
        }
        return;
    }

    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = match parse_descriptor(path, &dir_name) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::warn!("skipping bad descriptor {}: {e}", path.display());
            return;
        }
    };
    if manifest.runtime != DescriptorRuntime::Grpc {
        return;
    }

    let name = manifest.name.clone();
    loader.record(Discovery {
        name: name.clone(),
        path: dir.to_path_buf(),
        kind: DiscoveryKind::Rpc,
        manifest: Some(manifest),
        loaded: false,
    });

    let result = if loader.discovery(&name).is_some_and(|d| d.loaded) {
        loader.reload(&name).await
    } else {
        loader.materialize(&name).await
    };
    if let Err(e) = result {
        // Hot-reload failures never spread beyond the plugin at fault.
        tracing::warn!(plugin = %name, "descriptor load failed: {e}");
    }

    if let Some(watcher) = watcher.lock().as_mut() {
        watcher.watch(dir, RecursiveMode::NonRecursive).ok();
    }
}

async fn act_wasm(loader: &Arc<PluginLoader>, path: &Path) {
    let known = loader.find_by_wasm_path(path);

    if !path.exists() {
        if let Some(name) = known {
            tracing::info!(plugin = %name, "wasm artifact removed; unregistering");
            loader.remove(&name).await;
        }
        return;
    }

    let name = match known {
        Some(name) => name,
        None => {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                return;
            };
            loader.record(Discovery {
                name: stem.clone(),
                path: path.to_path_buf(),
                kind: DiscoveryKind::Wasm,
                manifest: None,
                loaded: false,
            });
            stem
        }
    };

    let result = if loader.discovery(&name).is_some_and(|d| d.loaded) {
        loader.reload(&name).await
    } else {
        loader.materialize(&name).await
    };
    if let Err(e) = result {
        tracing::warn!(plugin = %name, "wasm load failed: {e}");
    }
}

async fn act_binary(loader: &Arc<PluginLoader>, name: &str, path: &Path) {
    if path.exists() {
        if let Err(e) = loader.reload(name).await {
            tracing::warn!(plugin = %name, "binary reload failed: {e}");
        }
    } else {
        tracing::info!(plugin = %name, "binary removed; unregistering");
        loader.unload(name).await;
    }
}
