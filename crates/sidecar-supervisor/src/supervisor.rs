use crate::pane::PaneHost;
use crate::process::{ManagedProcess, ProcessRuntime, RestartDecision};
use sidecar_core::env::EnvContext;
use sidecar_core::events::{EventKind, EventLog};
use sidecar_core::manifest::{Manifest, ResolvedProcessConfig, Settings};
use sidecar_core::state::{ProcessState, ProcessStatus};
use sidecar_core::{ConfigError, ToolError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub use crate::process::{LogStream, StartOptions};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const HOST_POLL_FAST: Duration = Duration::from_millis(500);
const HOST_POLL_SLOW: Duration = Duration::from_secs(3);

/// Everything a supervisor needs to know about its workspace.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub config_dir: PathBuf,
    pub settings: Settings,
    pub runtime_dir: PathBuf,
    /// Binary invoked as `<wrap_program> wrap ...` inside every pane.
    pub wrap_program: PathBuf,
}

/// Events flowing from managed processes (and their probes) into the
/// supervisor's single consumer task. Processes never call back into the
/// supervisor directly.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Ready { name: String },
    PortDetected { name: String, port: u16 },
    ExportsChanged { name: String },
    Exited { name: String, exit_code: Option<i32> },
    HealthChanged { name: String, healthy: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReloadDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ReloadDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Registry of managed processes for one workspace. Owns the canonical
/// state map; all mutation flows through it.
pub struct Supervisor {
    config: SupervisorConfig,
    pane: Arc<dyn PaneHost>,
    event_log: EventLog,
    procs: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    order: RwLock<Vec<String>>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    restart_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        pane: Arc<dyn PaneHost>,
        event_log: EventLog,
    ) -> (Arc<Self>, mpsc::Receiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let supervisor = Arc::new(Self {
            config,
            pane,
            event_log,
            procs: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            events_tx,
            restart_timers: Mutex::new(HashMap::new()),
            shutdown_tx,
        });
        (supervisor, events_rx)
    }

    pub fn settings(&self) -> Settings {
        self.config.settings
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawns the event consumer and the pane reconcile loop.
    pub fn spawn_background(self: &Arc<Self>, events_rx: mpsc::Receiver<SupervisorEvent>) {
        let event_loop = Arc::clone(self);
        tokio::spawn(async move { event_loop.run_event_loop(events_rx).await });
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.run_host_poll().await });
    }

    /// Registers the manifest's processes. Fails on validation errors and
    /// leaves the registry untouched in that case.
    pub fn load(&self, manifest: &Manifest) -> Result<(), ConfigError> {
        let resolved = manifest.resolve(&self.config.config_dir)?;
        let order = manifest.topo_order()?;
        let mut procs = self.procs.write().unwrap();
        procs.clear();
        for (name, config) in resolved {
            procs.insert(name, self.make_process(config));
        }
        *self.order.write().unwrap() = order;
        Ok(())
    }

    fn make_process(&self, config: ResolvedProcessConfig) -> Arc<ManagedProcess> {
        ManagedProcess::new(
            config,
            ProcessRuntime {
                settings: self.config.settings,
                log_dir: self.config.runtime_dir.join("logs"),
                wrap_program: self.config.wrap_program.clone(),
                shutdown: self.shutdown_tx.subscribe(),
            },
            Arc::clone(&self.pane),
            self.events_tx.clone(),
        )
    }

    fn get(&self, name: &str) -> Result<Arc<ManagedProcess>, ToolError> {
        self.procs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    fn snapshot(&self) -> Vec<Arc<ManagedProcess>> {
        self.procs.read().unwrap().values().cloned().collect()
    }

    /// Starts every autoStart process, respecting dependency order. Each
    /// dependency chain advances independently; a failure in one chain does
    /// not hold unrelated processes back.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), ToolError> {
        let order = self.order.read().unwrap().clone();
        let mut join = JoinSet::new();
        for name in order {
            let Ok(proc) = self.get(&name) else { continue };
            if !proc.auto_start() {
                continue;
            }
            let supervisor = Arc::clone(self);
            join.spawn(async move { supervisor.start_after_deps(&name).await.map(|_| name) });
        }

        let mut failures = Vec::new();
        while let Some(result) = join.join_next().await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => failures.push(err.to_string()),
                Err(err) => failures.push(err.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ToolError::Internal(failures.join("; ")))
        }
    }

    /// Waits for every dependency to become ready (bounded by
    /// `dependencyTimeout`), then starts the process.
    async fn start_after_deps(self: &Arc<Self>, name: &str) -> Result<ProcessState, ToolError> {
        let proc = self.get(name)?;
        for dependency in proc.depends_on() {
            let dep = self.get(&dependency)?;
            if dep.is_ready() {
                continue;
            }
            if !dep.auto_start() {
                // A manual dependency will never come up on its own;
                // surface that instead of blocking until the timeout.
                proc.fail_dependency(&dependency);
                return Err(ToolError::DependencyNotReady {
                    process: name.to_string(),
                    dependency,
                });
            }
            let timeout = Duration::from_millis(self.config.settings.dependency_timeout);
            let mut ready_rx = dep.ready_rx();
            let wait = async {
                loop {
                    if *ready_rx.borrow_and_update() {
                        break;
                    }
                    if ready_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(timeout, wait).await.is_err() {
                warn!(event = "dependency_timeout", process = name, dependency = %dependency);
                proc.fail_dependency(&dependency);
                return Err(ToolError::DependencyNotReady {
                    process: name.to_string(),
                    dependency,
                });
            }
        }
        self.reinject_env();
        match proc.start(StartOptions::default()).await {
            Ok(state) => Ok(state),
            // Someone beat us to it; that is not a startup failure.
            Err(ToolError::AlreadyRunning(_)) => Ok(proc.get_state()),
            Err(err) => Err(err),
        }
    }

    /// Explicit start. Dependencies must already be ready; unlike
    /// `start_all` this never waits.
    pub async fn start_process(
        self: &Arc<Self>,
        name: &str,
        opts: StartOptions,
    ) -> Result<ProcessState, ToolError> {
        let proc = self.get(name)?;
        for dependency in proc.depends_on() {
            if !self.get(&dependency)?.is_ready() {
                return Err(ToolError::DependencyNotReady {
                    process: name.to_string(),
                    dependency,
                });
            }
        }
        self.cancel_restart(name);
        self.reinject_env();
        proc.start(opts).await
    }

    pub async fn stop_process(&self, name: &str) -> Result<ProcessState, ToolError> {
        let proc = self.get(name)?;
        self.cancel_restart(name);
        proc.stop().await
    }

    pub async fn restart_process(self: &Arc<Self>, name: &str) -> Result<ProcessState, ToolError> {
        let proc = self.get(name)?;
        self.cancel_restart(name);
        self.reinject_env();
        proc.restart().await
    }

    /// Restarts only if currently active; stopped processes are left alone.
    pub async fn restart_if_running(self: &Arc<Self>, name: &str) -> Result<bool, ToolError> {
        let proc = self.get(name)?;
        if !proc.get_state().status.is_active() {
            return Ok(false);
        }
        self.restart_process(name).await?;
        Ok(true)
    }

    /// Stops everything, dependents before their dependencies.
    pub async fn stop_all(&self) {
        for handle in self.restart_timers.lock().unwrap().drain() {
            handle.1.abort();
        }
        let order = self.order.read().unwrap().clone();
        for name in order.iter().rev() {
            if let Ok(proc) = self.get(name) {
                if let Err(err) = proc.stop().await {
                    warn!(event = "stop_error", process = %name, error = %err);
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.stop_all().await;
        let _ = self.shutdown_tx.send(true);
    }

    pub fn get_status(&self, name: &str) -> Result<ProcessState, ToolError> {
        Ok(self.get(name)?.get_state())
    }

    pub fn list_processes(&self) -> Vec<ProcessState> {
        let mut states: Vec<ProcessState> = self
            .snapshot()
            .iter()
            .map(|proc| proc.get_state())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn get_logs(
        &self,
        name: &str,
        stream: LogStream,
        tail: Option<usize>,
    ) -> Result<Vec<String>, ToolError> {
        Ok(self.get(name)?.get_logs(stream, tail))
    }

    pub fn get_url(&self, name: &str) -> Result<Option<String>, ToolError> {
        Ok(self.get(name)?.get_url())
    }

    /// Mapping from env file to the processes that load it; feeds the env
    /// file watcher's watch set.
    pub fn env_file_map(&self) -> HashMap<PathBuf, Vec<String>> {
        let mut map: HashMap<PathBuf, Vec<String>> = HashMap::new();
        for proc in self.snapshot() {
            if let Some(env_file) = proc.config().env_file {
                map.entry(env_file).or_default().push(proc.name().to_string());
            }
        }
        map
    }

    /// Env files changed on disk: restart affected processes in parallel.
    pub async fn on_env_files_changed(self: &Arc<Self>, names: HashSet<String>) {
        let mut join = JoinSet::new();
        for name in names {
            let supervisor = Arc::clone(self);
            join.spawn(async move {
                match supervisor.restart_if_running(&name).await {
                    Ok(restarted) => {
                        info!(event = "env_file_restart", process = %name, restarted);
                    }
                    Err(err) => {
                        warn!(event = "env_file_restart_error", process = %name, error = %err);
                    }
                }
            });
        }
        while join.join_next().await.is_some() {}
    }

    /// Applies a new manifest: stop removed and changed, re-register added
    /// and changed, start them in dependency order, emit a `reload` event.
    /// An empty diff changes nothing and emits nothing.
    pub async fn reload(self: &Arc<Self>, manifest: &Manifest) -> Result<ReloadDiff, ConfigError> {
        let new_resolved = manifest.resolve(&self.config.config_dir)?;
        let new_order = manifest.topo_order()?;

        let old_configs: BTreeMap<String, ResolvedProcessConfig> = self
            .snapshot()
            .iter()
            .map(|proc| (proc.name().to_string(), proc.config()))
            .collect();

        let diff = diff_configs(&old_configs, &new_resolved);
        if diff.is_empty() {
            debug!(event = "reload_noop");
            return Ok(diff);
        }
        info!(
            event = "reload",
            added = ?diff.added,
            removed = ?diff.removed,
            changed = ?diff.changed
        );

        for name in diff.removed.iter().chain(diff.changed.iter()) {
            self.cancel_restart(name);
            if let Ok(proc) = self.get(name) {
                let _ = proc.stop().await;
            }
        }
        {
            let mut procs = self.procs.write().unwrap();
            for name in &diff.removed {
                procs.remove(name);
            }
            for name in diff.added.iter().chain(diff.changed.iter()) {
                if let Some(config) = new_resolved.get(name) {
                    procs.insert(name.clone(), self.make_process(config.clone()));
                }
            }
        }
        *self.order.write().unwrap() = new_order.clone();
        self.reinject_env();

        let restart_set: HashSet<&String> =
            diff.added.iter().chain(diff.changed.iter()).collect();
        let mut join = JoinSet::new();
        for name in &new_order {
            if !restart_set.contains(name) {
                continue;
            }
            let Ok(proc) = self.get(name) else { continue };
            if !proc.auto_start() {
                continue;
            }
            let supervisor = Arc::clone(self);
            let name = name.clone();
            join.spawn(async move {
                if let Err(err) = supervisor.start_after_deps(&name).await {
                    warn!(event = "reload_start_error", process = %name, error = %err);
                }
            });
        }
        while join.join_next().await.is_some() {}

        if let Err(err) = self.event_log.append(EventKind::Reload {
            added: diff.added.clone(),
            removed: diff.removed.clone(),
            changed: diff.changed.clone(),
        }) {
            warn!(event = "reload_event_error", error = %err);
        }
        Ok(diff)
    }

    fn cancel_restart(&self, name: &str) {
        if let Some(handle) = self.restart_timers.lock().unwrap().remove(name) {
            handle.abort();
        }
    }

    /// Rebuilds the shared env context from live state and pushes it into
    /// every process.
    fn reinject_env(&self) {
        let mut ctx = EnvContext::with_system_env();
        for proc in self.snapshot() {
            let state = proc.get_state();
            if let Some(port) = state.port {
                ctx.process_ports.insert(state.name.clone(), port);
            }
            if !state.exports.is_empty() {
                ctx.process_exports.insert(state.name.clone(), state.exports);
            }
        }
        for proc in self.snapshot() {
            proc.set_env_context(ctx.clone());
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<SupervisorEvent>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Ready { name } => {
                debug!(event = "process_ready_observed", process = %name);
            }
            SupervisorEvent::PortDetected { name, port } => {
                info!(event = "port_detected", process = %name, port);
                self.reinject_env();
            }
            SupervisorEvent::ExportsChanged { name } => {
                debug!(event = "exports_changed", process = %name);
                self.reinject_env();
            }
            SupervisorEvent::HealthChanged { name, healthy } => {
                // Applied off the event loop: the readiness re-evaluation
                // feeds events back into the channel this loop drains.
                if let Ok(proc) = self.get(&name) {
                    tokio::spawn(async move { proc.apply_health(healthy).await });
                }
            }
            SupervisorEvent::Exited { name, exit_code } => {
                self.handle_crash(&name, exit_code).await;
            }
        }
    }

    async fn handle_crash(self: &Arc<Self>, name: &str, exit_code: Option<i32>) {
        let Ok(proc) = self.get(name) else { return };
        match proc.note_crash_and_decide() {
            RestartDecision::None => {}
            RestartDecision::GiveUp => {
                warn!(event = "restarts_exhausted", process = %name, ?exit_code);
            }
            RestartDecision::After(backoff) => {
                info!(
                    event = "restart_scheduled",
                    process = %name,
                    backoff_ms = backoff.as_millis() as u64
                );
                let supervisor = Arc::clone(self);
                let name_owned = name.to_string();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let Ok(proc) = supervisor.get(&name_owned) else {
                        return;
                    };
                    supervisor.reinject_env();
                    match proc.start(StartOptions::default()).await {
                        Ok(_) | Err(ToolError::AlreadyRunning(_)) => {}
                        Err(err) => {
                            warn!(event = "restart_failed", process = %name_owned, error = %err);
                        }
                    }
                });
                self.cancel_restart(name);
                self.restart_timers
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), handle);
            }
        }
    }

    /// Reconciles pane state with ours. Fast cadence while anything is
    /// coming up, slow once the workspace settles.
    async fn run_host_poll(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let settling = self.snapshot().iter().any(|proc| {
                matches!(
                    proc.get_state().status,
                    ProcessStatus::Starting | ProcessStatus::Running
                )
            });
            let interval = if settling { HOST_POLL_FAST } else { HOST_POLL_SLOW };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    for proc in self.snapshot() {
                        proc.poll_host_status().await;
                    }
                }
            }
        }
    }
}

/// Structural diff between two resolved process maps. `changed` holds names
/// present on both sides whose declared fields differ.
fn diff_configs(
    old: &BTreeMap<String, ResolvedProcessConfig>,
    new: &BTreeMap<String, ResolvedProcessConfig>,
) -> ReloadDiff {
    let mut diff = ReloadDiff::default();
    for name in new.keys() {
        if !old.contains_key(name) {
            diff.added.push(name.clone());
        }
    }
    for (name, old_config) in old {
        match new.get(name) {
            None => diff.removed.push(name.clone()),
            Some(new_config) if new_config != old_config => diff.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, command: &str) -> ResolvedProcessConfig {
        ResolvedProcessConfig {
            name: name.to_string(),
            command: command.to_string(),
            cwd: PathBuf::from("/tmp"),
            port: None,
            auto_start: true,
            env: BTreeMap::new(),
            env_file: None,
            stdout_pattern_vars: BTreeMap::new(),
            ready_vars: Vec::new(),
            health_check: None,
            depends_on: Vec::new(),
            restart_policy: Default::default(),
            max_restarts: 5,
            force: false,
        }
    }

    #[test]
    fn diff_is_exact_and_disjoint() {
        let old = BTreeMap::from([
            ("a".to_string(), config("a", "old")),
            ("b".to_string(), config("b", "keep")),
        ]);
        let new = BTreeMap::from([
            ("a".to_string(), config("a", "new")),
            ("c".to_string(), config("c", "fresh")),
        ]);
        let diff = diff_configs(&old, &new);
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["b"]);
        assert_eq!(diff.changed, vec!["a"]);

        let added: HashSet<_> = diff.added.iter().collect();
        let removed: HashSet<_> = diff.removed.iter().collect();
        let changed: HashSet<_> = diff.changed.iter().collect();
        assert!(added.is_disjoint(&removed));
        assert!(changed.is_disjoint(&added));
        assert!(changed.is_disjoint(&removed));
    }

    #[test]
    fn identical_configs_yield_empty_diff() {
        let old = BTreeMap::from([("a".to_string(), config("a", "same"))]);
        let diff = diff_configs(&old, &old.clone());
        assert!(diff.is_empty());
    }
}
