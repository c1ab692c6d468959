use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use sidecar_core::manifest::Manifest;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Watches the manifest file and delivers re-parsed manifests after a
/// debounce window. Parse failures keep the previous manifest in effect.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    pub manifests: mpsc::Receiver<Manifest>,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(
        manifest_path: PathBuf,
        shutdown: watch::Receiver<bool>,
    ) -> notify::Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<()>(64);
        let watched = manifest_path.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if event.paths.iter().any(|path| path == &watched) {
                        let _ = raw_tx.blocking_send(());
                    }
                }
                Err(err) => warn!(event = "config_watch_error", error = %err),
            }
        })?;
        // Watch the parent so editors that replace the file are still seen.
        let watch_root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| manifest_path.clone());
        watcher.watch(&watch_root, RecursiveMode::NonRecursive)?;

        let (manifest_tx, manifests) = mpsc::channel(8);
        let task = tokio::spawn(debounce_loop(
            manifest_path,
            raw_rx,
            manifest_tx,
            shutdown,
        ));
        Ok(Self {
            _watcher: watcher,
            manifests,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Collapses change bursts, waits for writes to stabilize, then re-parses.
async fn debounce_loop(
    manifest_path: PathBuf,
    mut raw_rx: mpsc::Receiver<()>,
    manifest_tx: mpsc::Sender<Manifest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = raw_rx.recv() => {
                if event.is_none() {
                    break;
                }
                // Drain the burst until the file goes quiet.
                loop {
                    match tokio::time::timeout(DEBOUNCE_WINDOW, raw_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                match Manifest::load(&manifest_path) {
                    Ok(manifest) => {
                        info!(event = "manifest_reloaded", path = %manifest_path.display());
                        if manifest_tx.send(manifest).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        // Keep running with the previous manifest.
                        warn!(event = "manifest_reload_error", error = %err);
                    }
                }
            }
        }
    }
}

/// Watches env files and reports which processes need a restart. The watch
/// set follows the manifest: call `update` after every reload.
pub struct EnvFileWatcher {
    watcher: Mutex<RecommendedWatcher>,
    mapping: Arc<Mutex<HashMap<PathBuf, Vec<String>>>>,
    watched: Mutex<HashSet<PathBuf>>,
    pub changed: mpsc::Receiver<HashSet<String>>,
    task: JoinHandle<()>,
}

impl EnvFileWatcher {
    pub fn spawn(shutdown: watch::Receiver<bool>) -> notify::Result<Self> {
        let mapping: Arc<Mutex<HashMap<PathBuf, Vec<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (raw_tx, raw_rx) = mpsc::channel::<PathBuf>(64);

        let mapping_for_events = Arc::clone(&mapping);
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let mapping = mapping_for_events.lock().unwrap();
                    for path in &event.paths {
                        if mapping.contains_key(path) {
                            let _ = raw_tx.blocking_send(path.clone());
                        }
                    }
                }
                Err(err) => warn!(event = "env_watch_error", error = %err),
            }
        })?;

        let (changed_tx, changed) = mpsc::channel(8);
        let task = tokio::spawn(env_debounce_loop(
            Arc::clone(&mapping),
            raw_rx,
            changed_tx,
            shutdown,
        ));
        Ok(Self {
            watcher: Mutex::new(watcher),
            mapping,
            watched: Mutex::new(HashSet::new()),
            changed,
            task,
        })
    }

    /// Replaces the env-file → process mapping and reconciles the set of
    /// watched directories.
    pub fn update(&self, map: HashMap<PathBuf, Vec<String>>) {
        let desired: HashSet<PathBuf> = map
            .keys()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        *self.mapping.lock().unwrap() = map;

        let mut watched = self.watched.lock().unwrap();
        let mut watcher = self.watcher.lock().unwrap();
        for stale in watched.difference(&desired).cloned().collect::<Vec<_>>() {
            debug!(event = "env_watch_remove", path = %stale.display());
            let _ = watcher.unwatch(&stale);
            watched.remove(&stale);
        }
        for fresh in desired.difference(&watched).cloned().collect::<Vec<_>>() {
            debug!(event = "env_watch_add", path = %fresh.display());
            if watcher.watch(&fresh, RecursiveMode::NonRecursive).is_ok() {
                watched.insert(fresh);
            }
        }
    }
}

impl Drop for EnvFileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn env_debounce_loop(
    mapping: Arc<Mutex<HashMap<PathBuf, Vec<String>>>>,
    mut raw_rx: mpsc::Receiver<PathBuf>,
    changed_tx: mpsc::Sender<HashSet<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut dirty: HashSet<PathBuf> = HashSet::new();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            path = raw_rx.recv() => {
                match path {
                    Some(path) => { dirty.insert(path); }
                    None => break,
                }
            }
        }
        loop {
            match tokio::time::timeout(DEBOUNCE_WINDOW, raw_rx.recv()).await {
                Ok(Some(path)) => {
                    dirty.insert(path);
                }
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let names: HashSet<String> = {
            let mapping = mapping.lock().unwrap();
            dirty
                .iter()
                .filter_map(|path| mapping.get(path))
                .flatten()
                .cloned()
                .collect()
        };
        if names.is_empty() {
            continue;
        }
        info!(event = "env_files_changed", processes = ?names);
        if changed_tx.send(names).await.is_err() {
            break;
        }
    }
}
