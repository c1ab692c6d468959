use crate::broker::{InteractionBroker, InteractionRequest};
use crate::supervisor::{LogStream, StartOptions, Supervisor};
use serde::Deserialize;
use serde_json::{json, Value};
use sidecar_core::ipc::{IpcRequest, IpcResponse};
use sidecar_core::manifest::Manifest;
use sidecar_core::ToolError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    name: String,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StartParams {
    name: String,
    #[serde(default)]
    args: Option<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    force: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InteractionIdParams {
    id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// The single entry point for every externally invokable operation. Both
/// the in-process CLI path and the IPC daemon route through here, so the
/// surface is identical regardless of transport.
pub struct ToolDispatcher {
    supervisor: Arc<Supervisor>,
    broker: Arc<InteractionBroker>,
    manifest_path: PathBuf,
}

impl ToolDispatcher {
    pub fn new(
        supervisor: Arc<Supervisor>,
        broker: Arc<InteractionBroker>,
        manifest_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            broker,
            manifest_path,
        })
    }

    /// Request envelope in, response envelope out; tool failures become
    /// `{ok:false,error}` rather than transport errors.
    pub async fn handle(&self, request: &IpcRequest) -> IpcResponse {
        let params = request.params.clone().unwrap_or(Value::Null);
        match self.dispatch(&request.method, params).await {
            Ok(result) => IpcResponse::ok(request.id.clone(), result),
            Err(err) => IpcResponse::err(request.id.clone(), err.to_string()),
        }
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        debug!(event = "tool_call", method = method);
        match method {
            "list_processes" => {
                let states = self.supervisor.list_processes();
                Ok(serde_json::to_value(states).unwrap_or(Value::Null))
            }
            "get_status" => {
                let params: NameParams = parse(params)?;
                let state = self.supervisor.get_status(&params.name)?;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            "get_logs" => {
                let params: LogsParams = parse(params)?;
                let stream = params
                    .stream
                    .as_deref()
                    .unwrap_or("combined")
                    .parse::<LogStream>()
                    .map_err(ToolError::InvalidRequest)?;
                let lines = self
                    .supervisor
                    .get_logs(&params.name, stream, params.tail)?;
                Ok(serde_json::to_value(lines).unwrap_or(Value::Null))
            }
            "get_url" => {
                let params: NameParams = parse(params)?;
                let url = self.supervisor.get_url(&params.name)?;
                Ok(serde_json::to_value(url).unwrap_or(Value::Null))
            }
            "start_process" => {
                let params: StartParams = parse(params)?;
                let opts = StartOptions {
                    args: params.args,
                    env: params.env.unwrap_or_default(),
                    force: params.force.unwrap_or(false),
                };
                let state = self.supervisor.start_process(&params.name, opts).await?;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            "stop_process" => {
                let params: NameParams = parse(params)?;
                let state = self.supervisor.stop_process(&params.name).await?;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            "restart_process" => {
                let params: NameParams = parse(params)?;
                let state = self.supervisor.restart_process(&params.name).await?;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            "reload" => {
                let manifest = Manifest::load(&self.manifest_path)
                    .map_err(|err| ToolError::InvalidRequest(err.to_string()))?;
                let diff = self
                    .supervisor
                    .reload(&manifest)
                    .await
                    .map_err(|err| ToolError::InvalidRequest(err.to_string()))?;
                Ok(serde_json::to_value(diff).unwrap_or(Value::Null))
            }
            "create_interaction" => {
                let request: InteractionRequest = parse(params)?;
                let id = self.broker.create(request).await?;
                Ok(json!({ "id": id, "status": "started" }))
            }
            "cancel_interaction" => {
                let params: InteractionIdParams = parse(params)?;
                self.broker.cancel(&params.id).await?;
                Ok(json!({ "ok": true }))
            }
            "shutdown" => {
                self.supervisor.shutdown().await;
                Ok(json!({ "ok": true }))
            }
            "wait_interaction" => {
                let params: InteractionIdParams = parse(params)?;
                let timeout = params.timeout_ms.map(Duration::from_millis);
                let event = self.broker.wait(&params.id, timeout).await?;
                Ok(serde_json::to_value(event).unwrap_or(Value::Null))
            }
            other => Err(ToolError::InvalidRequest(format!(
                "unknown method: {other}"
            ))),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|err| ToolError::InvalidRequest(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::TerminalWindowHost;
    use crate::supervisor::SupervisorConfig;
    use sidecar_core::events::EventLog;
    use sidecar_core::manifest::Settings;

    fn dispatcher() -> (tempfile::TempDir, Arc<ToolDispatcher>) {
        let dir = tempfile::tempdir().unwrap();
        let pane: Arc<dyn crate::pane::PaneHost> = Arc::new(TerminalWindowHost::new());
        let event_log = EventLog::new(dir.path().join("events.jsonl"));
        let (supervisor, _events_rx) = Supervisor::new(
            SupervisorConfig {
                config_dir: dir.path().to_path_buf(),
                settings: Settings::default(),
                runtime_dir: dir.path().to_path_buf(),
                wrap_program: PathBuf::from("sidecar"),
            },
            Arc::clone(&pane),
            event_log.clone(),
        );
        let broker = InteractionBroker::new(pane, event_log, dir.path().to_path_buf());
        let dispatcher =
            ToolDispatcher::new(supervisor, broker, dir.path().join("sidecar.yaml"));
        (dir, dispatcher)
    }

    #[tokio::test]
    async fn unknown_process_is_a_not_found_envelope() {
        let (_dir, dispatcher) = dispatcher();
        let request = IpcRequest {
            id: "1".to_string(),
            method: "get_status".to_string(),
            params: Some(json!({"name": "ghost"})),
        };
        let response = dispatcher.handle(&request).await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (_dir, dispatcher) = dispatcher();
        let response = dispatcher
            .handle(&IpcRequest {
                id: "2".to_string(),
                method: "frobnicate".to_string(),
                params: None,
            })
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("unknown method"));
    }

    #[tokio::test]
    async fn list_processes_returns_an_array() {
        let (_dir, dispatcher) = dispatcher();
        let result = dispatcher
            .dispatch("list_processes", Value::Null)
            .await
            .unwrap();
        assert!(result.is_array());
    }

    #[tokio::test]
    async fn invalid_interaction_request_is_an_invalid_request_error() {
        let (_dir, dispatcher) = dispatcher();
        let err = dispatcher
            .dispatch("create_interaction", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidRequest(_)));
    }
}
