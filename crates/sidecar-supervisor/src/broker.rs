use crate::pane::{FloatingOpts, PaneHost};
use sidecar_core::events::{Event, EventKind, EventLog, ResultAction};
use sidecar_core::ToolError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_UI_RUNNER: &str = "sidecar-ask";

/// What a caller may ask for: exactly one of an inline question schema, a UI
/// definition file, or a raw shell command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractionRequest {
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub args: Option<Value>,
}

struct Pending {
    pane_name: String,
    timeout: Option<JoinHandle<()>>,
}

/// Launches interaction UIs in floating panes and correlates their results
/// through the events file. The broker never reads the UI child's stdout;
/// completion always arrives via the log, so a wedged UI cannot wedge us.
pub struct InteractionBroker {
    pane: Arc<dyn PaneHost>,
    event_log: EventLog,
    pending: Mutex<HashMap<String, Pending>>,
    ui_runner: String,
    cwd: PathBuf,
}

impl InteractionBroker {
    pub fn new(pane: Arc<dyn PaneHost>, event_log: EventLog, cwd: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            pane,
            event_log,
            pending: Mutex::new(HashMap::new()),
            ui_runner: std::env::var("SIDECAR_UI_RUNNER")
                .unwrap_or_else(|_| DEFAULT_UI_RUNNER.to_string()),
            cwd,
        })
    }

    /// Non-blocking: spawns the floating pane and returns the fresh id
    /// immediately. Callers that want to block tail the events file.
    pub async fn create(self: &Arc<Self>, request: InteractionRequest) -> Result<String, ToolError> {
        let command = self.build_command(&request)?;
        let id = Uuid::new_v4().to_string();
        let pane_name = format!("interaction-{}", &id[..8]);

        let env = std::collections::BTreeMap::from([
            ("INTERACTION_ID".to_string(), id.clone()),
            (
                "EVENTS_FILE".to_string(),
                self.event_log.path().to_string_lossy().into_owned(),
            ),
        ]);
        let opts = FloatingOpts {
            name: request.title.clone().unwrap_or_else(|| pane_name.clone()),
            cwd: Some(self.cwd.clone()),
            width: Some("80%".to_string()),
            height: Some("60%".to_string()),
            x: None,
            y: None,
            close_on_exit: true,
        };
        self.pane
            .open_floating(&command, &opts, &env)
            .await
            .map_err(|err| ToolError::HostUnavailable(err.to_string()))?;

        let timeout = request.timeout_ms.map(|timeout_ms| {
            let broker = Arc::clone(self);
            let timeout_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                broker.expire(&timeout_id).await;
            })
        });
        self.pending.lock().unwrap().insert(
            id.clone(),
            Pending {
                pane_name: opts.name.clone(),
                timeout,
            },
        );
        info!(event = "interaction_started", id = %id, pane = %opts.name);
        Ok(id)
    }

    /// Kills the pane and records a cancel result. Idempotent via the event
    /// log's one-result-per-id rule.
    pub async fn cancel(&self, id: &str) -> Result<(), ToolError> {
        let pending = self
            .pending
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| ToolError::NotFound(id.to_string()))?;
        if let Some(timeout) = pending.timeout {
            timeout.abort();
        }
        let _ = self.pane.close_floating(&pending.pane_name).await;
        self.event_log
            .append(EventKind::Result {
                id: id.to_string(),
                action: ResultAction::Cancel,
                answers: None,
                result: None,
            })
            .map_err(|err| ToolError::Internal(err.to_string()))?;
        info!(event = "interaction_cancelled", id = id);
        Ok(())
    }

    /// Blocks until the matching result arrives in the events file. On
    /// timeout, records a timeout result and kills the pane. Results that
    /// predate the wait are returned immediately.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<Event, ToolError> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            if let Ok(Some(event)) = self.event_log.find_result(id) {
                self.settle(id, &event).await;
                return Ok(event);
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    self.expire(id).await;
                    return self
                        .event_log
                        .find_result(id)
                        .ok()
                        .flatten()
                        .ok_or_else(|| ToolError::Internal(format!("interaction {id} timed out")));
                }
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Background watcher: observes result events and closes accepted
    /// panes, so successful interactions clean up after themselves.
    pub fn spawn_result_watcher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut tailer = match broker.event_log.tail_from_end() {
                Ok(tailer) => tailer,
                Err(err) => {
                    warn!(event = "interaction_watch_error", error = %err);
                    return;
                }
            };
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(RESULT_POLL_INTERVAL) => {
                        let events = match tailer.poll() {
                            Ok(events) => events,
                            Err(err) => {
                                debug!(event = "interaction_watch_poll_error", error = %err);
                                continue;
                            }
                        };
                        for event in events {
                            if let EventKind::Result { id, .. } = &event.kind {
                                let id = id.clone();
                                broker.settle(&id, &event).await;
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Marks an interaction finished and closes its pane when the UI
    /// accepted (it is done rendering) or timed out.
    async fn settle(&self, id: &str, event: &Event) {
        let removed = self.pending.lock().unwrap().remove(id);
        let Some(pending) = removed else { return };
        if let Some(timeout) = pending.timeout {
            timeout.abort();
        }
        if let EventKind::Result { action, .. } = &event.kind {
            debug!(event = "interaction_settled", id = id, action = ?action);
            if *action == ResultAction::Accept {
                let _ = self.pane.close_floating(&pending.pane_name).await;
            }
        }
    }

    async fn expire(&self, id: &str) {
        let removed = self.pending.lock().unwrap().remove(id);
        if let Some(pending) = removed {
            if let Some(timeout) = pending.timeout {
                timeout.abort();
            }
            let _ = self.pane.close_floating(&pending.pane_name).await;
        }
        warn!(event = "interaction_timeout", id = id);
        // Idempotent: dropped if the UI managed to answer first.
        if let Err(err) = self.event_log.append(EventKind::Result {
            id: id.to_string(),
            action: ResultAction::Timeout,
            answers: None,
            result: None,
        }) {
            warn!(event = "interaction_timeout_event_error", id = id, error = %err);
        }
    }

    /// Either the raw command, or the UI runner with schema/file/args.
    fn build_command(&self, request: &InteractionRequest) -> Result<String, ToolError> {
        let sources =
            [request.schema.is_some(), request.file.is_some(), request.command.is_some()]
                .iter()
                .filter(|present| **present)
                .count();
        if sources != 1 {
            return Err(ToolError::InvalidRequest(
                "exactly one of schema, file, or command is required".to_string(),
            ));
        }
        if let Some(command) = &request.command {
            return Ok(command.clone());
        }

        let mut command = crate::pane::shell_quote(&self.ui_runner);
        if let Some(schema) = &request.schema {
            command.push_str(" --schema ");
            command.push_str(&crate::pane::shell_quote(&schema.to_string()));
        }
        if let Some(file) = &request.file {
            command.push_str(" --file ");
            command.push_str(&crate::pane::shell_quote(&file.to_string_lossy()));
        }
        if let Some(args) = &request.args {
            command.push_str(" --args ");
            command.push_str(&crate::pane::shell_quote(&args.to_string()));
        }
        if let Some(title) = &request.title {
            command.push_str(" --title ");
            command.push_str(&crate::pane::shell_quote(title));
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_for_tests() -> (tempfile::TempDir, Arc<InteractionBroker>) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        let pane: Arc<dyn PaneHost> = Arc::new(crate::pane::TerminalWindowHost::new());
        let broker = InteractionBroker::new(pane, log, dir.path().to_path_buf());
        (dir, broker)
    }

    #[test]
    fn rejects_zero_or_multiple_sources() {
        let (_dir, broker) = broker_for_tests();
        assert!(broker.build_command(&InteractionRequest::default()).is_err());
        let both = InteractionRequest {
            schema: Some(serde_json::json!({})),
            command: Some("true".to_string()),
            ..Default::default()
        };
        assert!(broker.build_command(&both).is_err());
    }

    #[test]
    fn raw_command_passes_through() {
        let (_dir, broker) = broker_for_tests();
        let request = InteractionRequest {
            command: Some("htop".to_string()),
            ..Default::default()
        };
        assert_eq!(broker.build_command(&request).unwrap(), "htop");
    }

    #[test]
    fn schema_invokes_the_ui_runner() {
        let (_dir, broker) = broker_for_tests();
        let request = InteractionRequest {
            schema: Some(serde_json::json!({"questions": []})),
            title: Some("Deploy?".to_string()),
            ..Default::default()
        };
        let command = broker.build_command(&request).unwrap();
        assert!(command.contains("--schema"));
        assert!(command.contains("--title"));
        assert!(command.starts_with(&broker.ui_runner));
    }
}
