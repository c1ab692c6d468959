use super::{wrapped_shell_command, FloatingOpts, PaneError, PaneHost, PaneId, PaneStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Fallback host that opens plain terminal windows on the host OS. Used when
/// no multiplexer is available; floating panes degrade to ordinary windows
/// and geometry hints are ignored.
pub struct TerminalWindowHost {
    terminal: Vec<String>,
    children: Mutex<BTreeMap<String, Child>>,
}

impl TerminalWindowHost {
    pub fn new() -> Self {
        Self {
            terminal: resolve_terminal(),
            children: Mutex::new(BTreeMap::new()),
        }
    }

    async fn spawn_window(
        &self,
        name: &str,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        let wrapped = wrapped_shell_command(command, cwd, env);
        let (program, rest) = self
            .terminal
            .split_first()
            .ok_or(PaneError::Unsupported("no terminal emulator configured"))?;

        let mut cmd = Command::new(program);
        cmd.args(rest).arg(&wrapped);
        let child = cmd
            .spawn()
            .map_err(|err| PaneError::Spawn(format!("{program}: {err}")))?;
        debug!(event = "window_spawned", name = name, pid = child.id());
        self.children.lock().await.insert(name.to_string(), child);
        Ok(())
    }

    async fn signal(&self, name: &str, interrupt: bool) -> Result<(), PaneError> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(name)
            .ok_or_else(|| PaneError::NotFound(name.to_string()))?;
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let signal = if interrupt {
                Signal::SIGINT
            } else {
                Signal::SIGKILL
            };
            let _ = kill(Pid::from_raw(pid as i32), signal);
            return Ok(());
        }
        if !interrupt {
            let _ = child.start_kill();
        }
        Ok(())
    }
}

impl Default for TerminalWindowHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaneHost for TerminalWindowHost {
    async fn create_pane(
        &self,
        name: &str,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<PaneId, PaneError> {
        self.spawn_window(name, command, cwd, env).await?;
        Ok(PaneId(name.to_string()))
    }

    async fn respawn_pane(
        &self,
        id: &PaneId,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        let _ = self.kill_pane(id).await;
        self.spawn_window(&id.0, command, cwd, env).await
    }

    async fn kill_pane(&self, id: &PaneId) -> Result<(), PaneError> {
        let mut children = self.children.lock().await;
        if let Some(mut child) = children.remove(&id.0) {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.kill().await;
            }
        }
        Ok(())
    }

    async fn send_interrupt(&self, id: &PaneId) -> Result<(), PaneError> {
        self.signal(&id.0, true).await
    }

    async fn capture_pane(&self, _id: &PaneId, _lines: usize) -> Result<String, PaneError> {
        Err(PaneError::Unsupported(
            "terminal windows cannot be captured",
        ))
    }

    async fn pane_status(&self, id: &PaneId) -> Result<PaneStatus, PaneError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&id.0) else {
            return Ok(PaneStatus::Missing);
        };
        match child.try_wait() {
            Ok(Some(status)) => Ok(PaneStatus::Dead {
                exit_code: status.code(),
            }),
            Ok(None) => Ok(PaneStatus::Running { pid: child.id() }),
            Err(err) => {
                warn!(event = "window_status_error", pane = %id, error = %err);
                Ok(PaneStatus::Missing)
            }
        }
    }

    async fn open_floating(
        &self,
        command: &str,
        opts: &FloatingOpts,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        let cwd = opts.cwd.clone().unwrap_or_else(std::env::temp_dir);
        self.spawn_window(&opts.name, command, &cwd, env).await
    }

    async fn close_floating(&self, name: &str) -> Result<(), PaneError> {
        self.kill_pane(&PaneId(name.to_string())).await
    }

    fn supports_geometry(&self) -> bool {
        false
    }
}

/// Terminal program and its "run this command" arguments, most specific
/// override first.
fn resolve_terminal() -> Vec<String> {
    if let Ok(value) = std::env::var("SIDECAR_TERMINAL") {
        let parts: Vec<String> = value.split_whitespace().map(String::from).collect();
        if !parts.is_empty() {
            return parts;
        }
    }
    if let Ok(value) = std::env::var("TERMINAL") {
        if !value.trim().is_empty() {
            return vec![value, "-e".to_string(), "sh".to_string(), "-c".to_string()];
        }
    }
    if cfg!(target_os = "macos") {
        return vec![
            "osascript".to_string(),
            "-e".to_string(),
            "tell application \"Terminal\" to do script".to_string(),
        ];
    }
    vec![
        "x-terminal-emulator".to_string(),
        "-e".to_string(),
        "sh".to_string(),
        "-c".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_pane_reports_missing() {
        let host = TerminalWindowHost::new();
        let status = host.pane_status(&PaneId("nope".to_string())).await.unwrap();
        assert_eq!(status, PaneStatus::Missing);
    }

    #[test]
    fn geometry_is_not_supported() {
        assert!(!TerminalWindowHost::new().supports_geometry());
    }
}
