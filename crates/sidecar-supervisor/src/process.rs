use crate::health::{self, HealthProbeConfig};
use crate::pane::{shell_quote, PaneError, PaneHost, PaneId, PaneStatus};
use crate::ports;
use crate::supervisor::SupervisorEvent;
use crate::tail::LineTailer;
use chrono::Utc;
use regex::Regex;
use sidecar_core::env::EnvContext;
use sidecar_core::logbuf::LogBuffer;
use sidecar_core::manifest::{ResolvedProcessConfig, RestartPolicy, Settings};
use sidecar_core::state::{ProcessState, ProcessStatus};
use sidecar_core::{ResolveError, ToolError};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_LOG_TAIL: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub args: Option<String>,
    pub env: BTreeMap<String, String>,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Combined,
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            "combined" | "" => Ok(LogStream::Combined),
            other => Err(format!("unknown log stream: {other}")),
        }
    }
}

/// What the supervisor should do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    None,
    After(Duration),
    GiveUp,
}

/// Shared pieces every managed process needs from its supervisor.
#[derive(Clone)]
pub struct ProcessRuntime {
    pub settings: Settings,
    pub log_dir: PathBuf,
    pub wrap_program: PathBuf,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Inner {
    status: ProcessStatus,
    pid: Option<u32>,
    port: Option<u16>,
    healthy: Option<bool>,
    restart_count: u32,
    last_restart_ms: Option<i64>,
    exit_code: Option<i32>,
    error: Option<String>,
    exports: BTreeMap<String, String>,
    stopping: bool,
    last_ready_at: Option<Instant>,
    last_backoff: Option<Duration>,
}

impl Inner {
    fn new() -> Self {
        Self {
            status: ProcessStatus::Pending,
            pid: None,
            port: None,
            healthy: None,
            restart_count: 0,
            last_restart_ms: None,
            exit_code: None,
            error: None,
            exports: BTreeMap::new(),
            stopping: false,
            last_ready_at: None,
            last_backoff: None,
        }
    }
}

/// Owns one supervised child: spawn through the pane host, log capture,
/// readiness, restart bookkeeping. Crash *handling* stays with the
/// supervisor — this type only reports exits as events.
pub struct ManagedProcess {
    name: String,
    config: RwLock<ResolvedProcessConfig>,
    patterns: RwLock<Vec<(String, Regex)>>,
    runtime: ProcessRuntime,
    pane: Arc<dyn PaneHost>,
    events: mpsc::Sender<SupervisorEvent>,
    env_ctx: RwLock<EnvContext>,
    inner: Mutex<Inner>,
    stdout_buf: Mutex<LogBuffer>,
    stderr_buf: Mutex<LogBuffer>,
    combined_buf: Mutex<LogBuffer>,
    ready_tx: watch::Sender<bool>,
    pane_id: Mutex<Option<PaneId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedProcess {
    pub fn new(
        config: ResolvedProcessConfig,
        runtime: ProcessRuntime,
        pane: Arc<dyn PaneHost>,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Arc<Self> {
        let capacity = runtime.settings.log_buffer_size;
        let patterns = compile_patterns(&config);
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            patterns: RwLock::new(patterns),
            runtime,
            pane,
            events,
            env_ctx: RwLock::new(EnvContext::with_system_env()),
            inner: Mutex::new(Inner::new()),
            stdout_buf: Mutex::new(LogBuffer::new(capacity)),
            stderr_buf: Mutex::new(LogBuffer::new(capacity)),
            combined_buf: Mutex::new(LogBuffer::new(capacity)),
            ready_tx,
            pane_id: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            probe: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> ResolvedProcessConfig {
        self.config.read().unwrap().clone()
    }

    pub fn auto_start(&self) -> bool {
        self.config.read().unwrap().auto_start
    }

    pub fn depends_on(&self) -> Vec<String> {
        self.config.read().unwrap().depends_on.clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn ready_rx(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Non-blocking snapshot of the observable state.
    pub fn get_state(&self) -> ProcessState {
        let inner = self.inner.lock().unwrap();
        ProcessState {
            name: self.name.clone(),
            status: inner.status,
            pid: inner.pid,
            port: inner.port,
            url: inner.port.map(|port| format!("http://localhost:{port}")),
            healthy: inner.healthy,
            restart_count: inner.restart_count,
            last_restart_time: inner.last_restart_ms,
            exit_code: inner.exit_code,
            error: inner.error.clone(),
            exports: inner.exports.clone(),
        }
    }

    pub fn get_url(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.port.map(|port| format!("http://localhost:{port}"))
    }

    pub fn get_logs(&self, stream: LogStream, tail: Option<usize>) -> Vec<String> {
        let tail = tail.unwrap_or(DEFAULT_LOG_TAIL);
        let buffer = match stream {
            LogStream::Stdout => &self.stdout_buf,
            LogStream::Stderr => &self.stderr_buf,
            LogStream::Combined => &self.combined_buf,
        };
        buffer.lock().unwrap().tail(tail)
    }

    /// The supervisor re-injects the shared context whenever ports or
    /// exports change anywhere in the workspace.
    pub fn set_env_context(&self, ctx: EnvContext) {
        *self.env_ctx.write().unwrap() = ctx;
    }

    pub async fn start(self: &Arc<Self>, opts: StartOptions) -> Result<ProcessState, ToolError> {
        // Claim the start before the first await so concurrent callers
        // cannot double-spawn.
        let previous_status = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status.is_active() {
                return Err(ToolError::AlreadyRunning(self.name.clone()));
            }
            let previous = inner.status;
            inner.status = ProcessStatus::Starting;
            inner.stopping = false;
            previous
        };
        let config = self.config();

        if opts.force || config.force {
            if let Some(port) = config.port {
                let own: HashSet<u32> = HashSet::from([std::process::id()]);
                let freed = match ports::free_port(port, &own).await {
                    Ok(freed) => freed,
                    Err(err) => {
                        self.revert_start(previous_status, &err.to_string());
                        return Err(ToolError::Internal(err.to_string()));
                    }
                };
                if !freed {
                    let message = format!("port {port} is still bound after reclaim");
                    self.revert_start(previous_status, &message);
                    return Err(ToolError::Internal(message));
                }
            }
        }

        let (pane_command, merged_env) = match self.build_launch(&config, &opts) {
            Ok(parts) => parts,
            Err(err) => {
                // Unresolved references leave the process where it was.
                self.revert_start(previous_status, &err.to_string());
                return Err(ToolError::Unresolved(err));
            }
        };

        let attempt = {
            let mut inner = self.inner.lock().unwrap();
            inner.exit_code = None;
            inner.error = None;
            inner.healthy = None;
            inner.exports.clear();
            if let Some(port) = config.port.or(inner.port) {
                inner.port = Some(port);
                inner.exports.insert("port".to_string(), port.to_string());
            }
            inner.restart_count
        };
        let _ = self.ready_tx.send(false);
        info!(
            event = "process_start",
            process = %self.name,
            attempt,
            command = %config.command
        );

        let pane_id = match self
            .pane
            .create_pane(&self.name, &pane_command, &config.cwd, &merged_env)
            .await
        {
            Ok(pane_id) => pane_id,
            Err(err) => {
                self.fail_spawn(&err);
                return Err(ToolError::HostUnavailable(err.to_string()));
            }
        };
        *self.pane_id.lock().unwrap() = Some(pane_id.clone());

        let pid = match self.pane.pane_status(&pane_id).await {
            Ok(PaneStatus::Running { pid }) => pid,
            Ok(PaneStatus::Dead { exit_code }) => {
                // Died before we first looked; reconcile as an exit.
                self.handle_exit(exit_code).await;
                return Ok(self.get_state());
            }
            Ok(PaneStatus::Missing) | Err(_) => None,
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.pid = pid;
            inner.status = ProcessStatus::Running;
        }

        self.spawn_tailers();
        self.ensure_probe();
        self.evaluate_ready().await;
        Ok(self.get_state())
    }

    /// Interrupt, wait up to `processStopTimeout`, then kill. Restart count
    /// is preserved; pending restarts are cancelled by the supervisor.
    pub async fn stop(&self) -> Result<ProcessState, ToolError> {
        let was_active = {
            let mut inner = self.inner.lock().unwrap();
            let was_active = inner.status.is_active();
            inner.stopping = true;
            was_active
        };

        let pane_id = self.pane_id.lock().unwrap().clone();
        if was_active {
            if let Some(pane_id) = &pane_id {
                let _ = self.pane.send_interrupt(pane_id).await;
                let deadline =
                    Instant::now() + Duration::from_millis(self.runtime.settings.process_stop_timeout);
                loop {
                    match self.pane.pane_status(pane_id).await {
                        Ok(PaneStatus::Dead { .. }) | Ok(PaneStatus::Missing) => break,
                        _ if Instant::now() >= deadline => {
                            warn!(event = "process_stop_kill", process = %self.name);
                            let _ = self.pane.kill_pane(pane_id).await;
                            break;
                        }
                        _ => tokio::time::sleep(STOP_POLL_INTERVAL).await,
                    }
                }
            }
        }

        self.abort_tasks();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = ProcessStatus::Stopped;
            inner.pid = None;
            inner.healthy = None;
            inner.stopping = false;
        }
        let _ = self.ready_tx.send(false);
        info!(event = "process_stopped", process = %self.name);
        Ok(self.get_state())
    }

    pub async fn restart(self: &Arc<Self>) -> Result<ProcessState, ToolError> {
        self.stop().await?;
        self.start(StartOptions::default()).await
    }

    /// Reconciles the pane's view of the child with ours. Detects panes the
    /// user killed externally.
    pub async fn poll_host_status(self: &Arc<Self>) {
        let active = {
            let inner = self.inner.lock().unwrap();
            inner.status.is_active() && !inner.stopping
        };
        if !active {
            return;
        }
        let Some(pane_id) = self.pane_id.lock().unwrap().clone() else {
            return;
        };
        match self.pane.pane_status(&pane_id).await {
            Ok(PaneStatus::Dead { exit_code }) => self.handle_exit(exit_code).await,
            Ok(PaneStatus::Missing) => {
                debug!(event = "pane_vanished", process = %self.name);
                self.handle_exit(None).await;
            }
            Ok(PaneStatus::Running { pid }) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.pid.is_none() {
                    inner.pid = pid;
                }
            }
            Err(err) => {
                debug!(event = "pane_status_error", process = %self.name, error = %err);
            }
        }
    }

    /// Child exit observed. Transitions to `completed` or `crashed` and
    /// reports upward; scheduling any restart is the supervisor's call.
    pub async fn handle_exit(&self, exit_code: Option<i32>) {
        let report = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopping || !inner.status.is_active() {
                None
            } else {
                let config = self.config.read().unwrap();
                inner.pid = None;
                inner.exit_code = exit_code;
                if config.restart_policy == RestartPolicy::Never && exit_code == Some(0) {
                    inner.status = ProcessStatus::Completed;
                } else {
                    inner.status = ProcessStatus::Crashed;
                    inner.error = Some(match exit_code {
                        Some(code) => format!("exited with code {code}"),
                        None => "exited unexpectedly".to_string(),
                    });
                }
                Some(inner.status)
            }
        };
        let Some(status) = report else { return };
        let _ = self.ready_tx.send(status == ProcessStatus::Completed);
        self.abort_tasks();
        info!(event = "process_exit", process = %self.name, ?exit_code, status = %status);
        let _ = self
            .events
            .send(SupervisorEvent::Exited {
                name: self.name.clone(),
                exit_code,
            })
            .await;
    }

    /// Applies the restart policy and backoff schedule to the crash we just
    /// observed. Resets the counter when the previous run stayed ready
    /// longer than the last backoff.
    pub fn note_crash_and_decide(&self) -> RestartDecision {
        let config = self.config.read().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if inner.status != ProcessStatus::Crashed {
            return RestartDecision::None;
        }
        match config.restart_policy {
            RestartPolicy::Never => return RestartDecision::None,
            RestartPolicy::OnFailure if inner.exit_code == Some(0) => {
                return RestartDecision::None
            }
            _ => {}
        }

        if let (Some(ready_at), Some(last_backoff)) = (inner.last_ready_at, inner.last_backoff) {
            if ready_at.elapsed() > last_backoff {
                debug!(event = "restart_counter_reset", process = %self.name);
                inner.restart_count = 0;
            }
        }

        if inner.restart_count >= config.max_restarts {
            inner.error = Some("max restarts exceeded".to_string());
            return RestartDecision::GiveUp;
        }

        let backoff = Duration::from_millis(
            (1000u64 << inner.restart_count.min(30))
                .min(self.runtime.settings.restart_backoff_max),
        );
        inner.restart_count += 1;
        inner.last_restart_ms = Some(Utc::now().timestamp_millis());
        inner.last_backoff = Some(backoff);
        RestartDecision::After(backoff)
    }

    /// Health probe flip routed back by the supervisor.
    pub async fn apply_health(&self, healthy: bool) {
        let downgraded = {
            let mut inner = self.inner.lock().unwrap();
            inner.healthy = Some(healthy);
            if !healthy && inner.status == ProcessStatus::Ready {
                inner.status = ProcessStatus::Running;
                true
            } else {
                false
            }
        };
        if downgraded {
            warn!(event = "process_unhealthy", process = %self.name);
            let _ = self.ready_tx.send(false);
        } else if healthy {
            self.evaluate_ready().await;
        }
    }

    /// Records the dependency-wait failure: the start attempt is abandoned
    /// and the restart counter advances.
    pub fn fail_dependency(&self, dependency: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = ProcessStatus::Crashed;
        inner.restart_count = inner.restart_count.saturating_add(1);
        inner.error = Some(format!(
            "dependency '{dependency}' did not become ready in time"
        ));
    }

    /// Rolls back a claimed start that never reached the pane host.
    fn revert_start(&self, previous_status: ProcessStatus, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = previous_status;
        inner.error = Some(message.to_string());
    }

    fn fail_spawn(&self, err: &PaneError) {
        warn!(event = "process_spawn_failed", process = %self.name, error = %err);
        let mut inner = self.inner.lock().unwrap();
        inner.status = ProcessStatus::Crashed;
        inner.error = Some(format!("spawn failed: {err}"));
    }

    /// Resolved pane command plus merged environment for one launch.
    fn build_launch(
        &self,
        config: &ResolvedProcessConfig,
        opts: &StartOptions,
    ) -> Result<(String, BTreeMap<String, String>), ResolveError> {
        let ctx = {
            let mut ctx = self.env_ctx.read().unwrap().clone();
            let inner = self.inner.lock().unwrap();
            ctx.current_port = config.port.or(inner.port);
            ctx
        };

        let mut command = ctx.resolve(&config.command)?;
        if let Some(args) = &opts.args {
            if !args.trim().is_empty() {
                command.push(' ');
                command.push_str(args.trim());
            }
        }

        // config.env, overlaid by envFile, overlaid by per-start overrides.
        let mut env = config.env.clone();
        if let Some(env_file) = &config.env_file {
            if let Ok(iter) = dotenvy::from_path_iter(env_file) {
                for item in iter.flatten() {
                    env.insert(item.0, item.1);
                }
            }
        }
        env.extend(opts.env.clone());
        let mut env = ctx.resolve_map(&env)?;
        if let Some(port) = ctx.current_port {
            env.insert("PORT".to_string(), port.to_string());
        }

        let out_log = self.stdout_log_path();
        let err_log = self.stderr_log_path();
        if let Some(parent) = out_log.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        // Fresh files per run so the tailers never replay an old run.
        let _ = std::fs::File::create(&out_log);
        let _ = std::fs::File::create(&err_log);

        let pane_command = format!(
            "{} wrap --stdout-log {} --stderr-log {} --command {}",
            shell_quote(&self.runtime.wrap_program.to_string_lossy()),
            shell_quote(&out_log.to_string_lossy()),
            shell_quote(&err_log.to_string_lossy()),
            shell_quote(&command),
        );
        Ok((pane_command, env))
    }

    pub fn stdout_log_path(&self) -> PathBuf {
        self.runtime.log_dir.join(format!("{}.out.log", self.name))
    }

    pub fn stderr_log_path(&self) -> PathBuf {
        self.runtime.log_dir.join(format!("{}.err.log", self.name))
    }

    fn spawn_tailers(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        for (stream, path) in [
            (LogStream::Stdout, self.stdout_log_path()),
            (LogStream::Stderr, self.stderr_log_path()),
        ] {
            let process = Arc::clone(self);
            let mut shutdown = self.runtime.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut tailer = LineTailer::new(path);
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {
                            match tailer.poll() {
                                Ok(lines) => {
                                    for line in lines {
                                        process.handle_log_line(stream, &line).await;
                                    }
                                }
                                Err(err) => {
                                    debug!(event = "tail_error", process = %process.name, error = %err);
                                }
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Starts the health probe once its URL is resolvable (needs either an
    /// absolute URL or a known port).
    fn ensure_probe(self: &Arc<Self>) {
        let config = self.config.read().unwrap();
        if config.health_check.is_none() {
            return;
        }
        let port = self.inner.lock().unwrap().port;
        let Some(url) = config.health_url(port) else {
            return;
        };
        let mut probe = self.probe.lock().unwrap();
        if probe.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *probe = Some(health::spawn_probe(
            self.name.clone(),
            HealthProbeConfig::new(url, self.runtime.settings.health_check_interval),
            self.events.clone(),
            self.runtime.shutdown.clone(),
        ));
    }

    async fn handle_log_line(self: &Arc<Self>, stream: LogStream, line: &str) {
        {
            let buffer = match stream {
                LogStream::Stdout => &self.stdout_buf,
                LogStream::Stderr => &self.stderr_buf,
                LogStream::Combined => unreachable!("tailers feed concrete streams"),
            };
            buffer.lock().unwrap().push(line.to_string());
            self.combined_buf.lock().unwrap().push(line.to_string());
        }

        let mut outgoing = Vec::new();
        let mut probe_may_start = false;
        {
            let config = self.config.read().unwrap();
            let mut inner = self.inner.lock().unwrap();

            if inner.port.is_none() {
                if let Some(port) = ports::detect_port(line) {
                    inner.port = Some(port);
                    inner.exports.insert("port".to_string(), port.to_string());
                    outgoing.push(SupervisorEvent::PortDetected {
                        name: self.name.clone(),
                        port,
                    });
                    probe_may_start = config.health_check.is_some();
                }
            }

            let mut exports_changed = false;
            for (var, pattern) in self.patterns.read().unwrap().iter() {
                if let Some(caps) = pattern.captures(line) {
                    if let Some(value) = caps.get(1) {
                        inner
                            .exports
                            .insert(var.clone(), value.as_str().to_string());
                        exports_changed = true;
                    }
                }
            }
            if exports_changed {
                outgoing.push(SupervisorEvent::ExportsChanged {
                    name: self.name.clone(),
                });
            }
        }

        for event in outgoing {
            let _ = self.events.send(event).await;
        }
        if probe_may_start {
            self.ensure_probe();
        }
        self.evaluate_ready().await;
    }

    /// Readiness rule chain, re-evaluated whenever a ready-input changes.
    async fn evaluate_ready(&self) {
        let became_ready = {
            let config = self.config.read().unwrap();
            let mut inner = self.inner.lock().unwrap();
            if !matches!(
                inner.status,
                ProcessStatus::Starting | ProcessStatus::Running
            ) {
                return;
            }
            let ready = if config.health_check.is_some() {
                inner.healthy == Some(true)
            } else if !config.ready_vars.is_empty() {
                config
                    .ready_vars
                    .iter()
                    .all(|var| inner.exports.contains_key(var))
            } else if config.port.is_some() || inner.port.is_some() {
                true
            } else if config.restart_policy == RestartPolicy::Never {
                // Ready means completed for run-to-completion processes.
                false
            } else {
                true
            };
            if ready {
                inner.status = ProcessStatus::Ready;
                inner.last_ready_at = Some(Instant::now());
            }
            ready
        };
        if became_ready {
            info!(event = "process_ready", process = %self.name);
            let _ = self.ready_tx.send(true);
            let _ = self
                .events
                .send(SupervisorEvent::Ready {
                    name: self.name.clone(),
                })
                .await;
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(probe) = self.probe.lock().unwrap().take() {
            probe.abort();
        }
    }
}

fn compile_patterns(config: &ResolvedProcessConfig) -> Vec<(String, Regex)> {
    config
        .stdout_pattern_vars
        .iter()
        .filter_map(|(var, pattern)| {
            Regex::new(pattern)
                .ok()
                .map(|regex| (var.clone(), regex))
        })
        .collect()
}
