use crate::dispatch::ToolDispatcher;
use serde_json::Value;
use sidecar_core::ipc::{
    self, IpcRequest, IpcResponse, IDLE_TIMEOUT_SECS, MAX_CONNECTIONS, MAX_FRAME_BYTES,
    PROBE_TIMEOUT_MS,
};
use sidecar_core::session::SessionIdentity;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IpcClientError {
    #[error("no daemon reachable at {0}")]
    NoDaemon(String),
    #[error("ipc io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Frame(#[from] ipc::IpcError),
    #[error("daemon reported: {0}")]
    Remote(String),
    #[error("connection closed by daemon")]
    Closed,
    #[error("ipc is not supported on this platform")]
    Unsupported,
}

/// Which role this invocation won in the per-workspace handshake.
pub enum Endpoint {
    /// We bound the socket: initialize the supervisor and serve.
    Daemon(Listener),
    /// Another supervisor owns the workspace: forward tool calls to it.
    Proxy(IpcClient),
}

#[cfg(unix)]
pub type Listener = tokio::net::UnixListener;
#[cfg(not(unix))]
pub type Listener = std::convert::Infallible;

/// Probe-then-bind. The socket is the synchronization primitive: exactly
/// one invocation per workspace wins the bind; everyone else proxies.
#[cfg(unix)]
pub async fn connect_or_bind(identity: &SessionIdentity) -> Result<Endpoint, IpcClientError> {
    let path = identity.socket_path();
    if let Some(client) = IpcClient::try_connect(identity).await? {
        return Ok(Endpoint::Proxy(client));
    }
    match tokio::net::UnixListener::bind(&path) {
        Ok(listener) => {
            restrict_socket(&path);
            Ok(Endpoint::Daemon(listener))
        }
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // Lost the race, or the previous daemon died without cleanup.
            if let Some(client) = IpcClient::try_connect(identity).await? {
                return Ok(Endpoint::Proxy(client));
            }
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path)?;
            restrict_socket(&path);
            Ok(Endpoint::Daemon(listener))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(not(unix))]
pub async fn connect_or_bind(_identity: &SessionIdentity) -> Result<Endpoint, IpcClientError> {
    Err(IpcClientError::Unsupported)
}

#[cfg(unix)]
fn restrict_socket(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

/// Serves length-delimited JSON requests until shutdown. Enforces the
/// protocol limits: bounded concurrent connections, max request size, and
/// an idle timeout per connection.
#[cfg(unix)]
pub async fn serve(
    listener: Listener,
    dispatcher: Arc<ToolDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let limiter = Arc::new(tokio::sync::Semaphore::new(MAX_CONNECTIONS));
    info!(event = "ipc_serve", max_connections = MAX_CONNECTIONS);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                            warn!(event = "ipc_conn_limit");
                            drop(stream);
                            continue;
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            handle_connection(stream, dispatcher, conn_shutdown).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "ipc_accept_error", error = %err);
                    }
                }
            }
        }
    }
    info!(event = "ipc_serve_stopped");
}

#[cfg(unix)]
async fn handle_connection(
    stream: tokio::net::UnixStream,
    dispatcher: Arc<ToolDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    let (reader_half, mut writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);
    let idle = Duration::from_secs(IDLE_TIMEOUT_SECS);
    // One byte past the limit so an exactly-at-limit frame still fits its
    // newline and anything larger is detectable.
    let frame_cap = (MAX_FRAME_BYTES + 2) as u64;

    loop {
        let mut line = Vec::new();
        let read = {
            let mut limited = (&mut reader).take(frame_cap);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                read = tokio::time::timeout(idle, limited.read_until(b'\n', &mut line)) => read,
            }
        };
        let read = match read {
            Ok(Ok(0)) => return,
            Ok(Ok(read)) => read,
            Ok(Err(err)) => {
                debug!(event = "ipc_read_error", error = %err);
                return;
            }
            Err(_) => {
                debug!(event = "ipc_idle_timeout");
                return;
            }
        };

        // Hit the cap without finding a newline: oversize request. Report
        // once and destroy the connection.
        if read as u64 >= frame_cap && !line.ends_with(b"\n") {
            let response = IpcResponse::err("", "request exceeds maximum size");
            let _ = write_frame(&mut writer_half, &response).await;
            return;
        }
        if line.iter().all(|byte| byte.is_ascii_whitespace()) {
            continue;
        }

        let request: IpcRequest = match ipc::decode_frame(&line) {
            Ok(request) => request,
            Err(err) => {
                let response = IpcResponse::err("", err.to_string());
                let _ = write_frame(&mut writer_half, &response).await;
                return;
            }
        };
        if let Err(err) = ipc::validate_request(&request) {
            let response = IpcResponse::err(request.id.clone(), err.to_string());
            let _ = write_frame(&mut writer_half, &response).await;
            return;
        }

        let response = dispatcher.handle(&request).await;
        if write_frame(&mut writer_half, &response).await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
async fn write_frame(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &IpcResponse,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let frame = ipc::encode_frame(response)
        .unwrap_or_else(|_| b"{\"id\":\"\",\"ok\":false,\"error\":\"encode failure\"}\n".to_vec());
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Client side of the reuse protocol: one request, one response, matched by
/// id over a persistent stream.
pub struct IpcClient {
    #[cfg(unix)]
    reader: tokio::io::BufReader<tokio::net::unix::OwnedReadHalf>,
    #[cfg(unix)]
    writer: tokio::net::unix::OwnedWriteHalf,
    next_id: u64,
}

impl IpcClient {
    /// Probes the workspace socket with a short connect timeout. `None`
    /// means nobody is serving it.
    #[cfg(unix)]
    pub async fn try_connect(identity: &SessionIdentity) -> Result<Option<Self>, IpcClientError> {
        let path = identity.socket_path();
        if !path.exists() {
            return Ok(None);
        }
        let connect = tokio::net::UnixStream::connect(&path);
        match tokio::time::timeout(Duration::from_millis(PROBE_TIMEOUT_MS), connect).await {
            Ok(Ok(stream)) => {
                let (reader_half, writer) = stream.into_split();
                Ok(Some(Self {
                    reader: tokio::io::BufReader::new(reader_half),
                    writer,
                    next_id: 0,
                }))
            }
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    #[cfg(not(unix))]
    pub async fn try_connect(_identity: &SessionIdentity) -> Result<Option<Self>, IpcClientError> {
        Err(IpcClientError::Unsupported)
    }

    /// Connects or fails; used by CLI commands that require a live daemon.
    pub async fn connect(identity: &SessionIdentity) -> Result<Self, IpcClientError> {
        match Self::try_connect(identity).await? {
            Some(client) => Ok(client),
            None => Err(IpcClientError::NoDaemon(
                identity.socket_path().display().to_string(),
            )),
        }
    }

    #[cfg(unix)]
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, IpcClientError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

        self.next_id += 1;
        let request = IpcRequest {
            id: format!("req-{}", self.next_id),
            method: method.to_string(),
            params: if params.is_null() { None } else { Some(params) },
        };
        let frame = ipc::encode_frame(&request)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;

        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(IpcClientError::Closed);
        }
        let response: IpcResponse = ipc::decode_frame(&line)?;
        if response.ok {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(IpcClientError::Remote(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    #[cfg(not(unix))]
    pub async fn call(&mut self, _method: &str, _params: Value) -> Result<Value, IpcClientError> {
        Err(IpcClientError::Unsupported)
    }
}
