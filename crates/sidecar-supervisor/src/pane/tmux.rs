use super::{wrapped_shell_command, FloatingOpts, PaneError, PaneHost, PaneId, PaneStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, warn};

const PLACEHOLDER_WINDOW: &str = "__sidecar__";

/// Panes are windows of a private tmux session. The session is created
/// detached with a placeholder window; `remain-on-exit` keeps dead panes
/// around so their exit status can be polled.
pub struct TmuxPaneHost {
    session: String,
    tmux_bin: String,
    placeholder_free: AtomicBool,
}

impl TmuxPaneHost {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            tmux_bin: std::env::var("SIDECAR_TMUX").unwrap_or_else(|_| "tmux".to_string()),
            placeholder_free: AtomicBool::new(false),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    async fn run(&self, args: &[&str]) -> Result<String, PaneError> {
        debug!(event = "tmux_exec", args = ?args);
        let output = Command::new(&self.tmux_bin)
            .args(args)
            .output()
            .await
            .map_err(|err| PaneError::Spawn(format!("{}: {err}", self.tmux_bin)))?;
        if !output.status.success() {
            return Err(PaneError::CommandFailed {
                command: format!("{} {}", self.tmux_bin, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn session_exists(&self) -> bool {
        Command::new(&self.tmux_bin)
            .args(["has-session", "-t", &format!("={}", self.session)])
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Creates the detached session on first use and marks its placeholder
    /// window as reusable for the first real pane.
    pub async fn ensure_session(&self) -> Result<(), PaneError> {
        if self.session_exists().await {
            return Ok(());
        }
        self.run(&[
            "new-session",
            "-d",
            "-s",
            &self.session,
            "-n",
            PLACEHOLDER_WINDOW,
        ])
        .await?;
        self.run(&["set-option", "-t", &self.session, "remain-on-exit", "on"])
            .await?;
        self.placeholder_free.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn kill_session(&self) -> Result<(), PaneError> {
        if self.session_exists().await {
            self.run(&["kill-session", "-t", &format!("={}", self.session)])
                .await?;
        }
        Ok(())
    }

    fn window_target(&self, name: &str) -> String {
        format!("={}:{name}", self.session)
    }

    async fn window_line(&self, name: &str) -> Result<Option<String>, PaneError> {
        let listing = self
            .run(&[
                "list-windows",
                "-t",
                &format!("={}", self.session),
                "-F",
                "#{window_name}\t#{pane_dead}\t#{pane_dead_status}\t#{pane_pid}",
            ])
            .await?;
        Ok(listing
            .lines()
            .find(|line| line.split('\t').next() == Some(name))
            .map(|line| line.to_string()))
    }
}

#[async_trait]
impl PaneHost for TmuxPaneHost {
    async fn create_pane(
        &self,
        name: &str,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<PaneId, PaneError> {
        self.ensure_session().await?;
        let wrapped = wrapped_shell_command(command, cwd, env);

        if self.placeholder_free.swap(false, Ordering::SeqCst)
            && self.window_line(PLACEHOLDER_WINDOW).await?.is_some()
        {
            let target = self.window_target(PLACEHOLDER_WINDOW);
            self.run(&["rename-window", "-t", &target, name]).await?;
            self.run(&[
                "respawn-window",
                "-k",
                "-t",
                &self.window_target(name),
                &wrapped,
            ])
            .await?;
            return Ok(PaneId(name.to_string()));
        }

        self.run(&[
            "new-window",
            "-d",
            "-t",
            &format!("={}", self.session),
            "-n",
            name,
            &wrapped,
        ])
        .await?;
        Ok(PaneId(name.to_string()))
    }

    async fn respawn_pane(
        &self,
        id: &PaneId,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        let wrapped = wrapped_shell_command(command, cwd, env);
        self.run(&["respawn-window", "-k", "-t", &self.window_target(&id.0), &wrapped])
            .await?;
        Ok(())
    }

    async fn kill_pane(&self, id: &PaneId) -> Result<(), PaneError> {
        match self
            .run(&["kill-window", "-t", &self.window_target(&id.0)])
            .await
        {
            Ok(_) => Ok(()),
            // Already gone is not an error worth surfacing to the caller.
            Err(PaneError::CommandFailed { stderr, .. })
                if stderr.contains("can't find") || stderr.contains("no such window") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn send_interrupt(&self, id: &PaneId) -> Result<(), PaneError> {
        self.run(&["send-keys", "-t", &self.window_target(&id.0), "C-c"])
            .await?;
        Ok(())
    }

    async fn capture_pane(&self, id: &PaneId, lines: usize) -> Result<String, PaneError> {
        let start = format!("-{lines}");
        self.run(&[
            "capture-pane",
            "-p",
            "-t",
            &self.window_target(&id.0),
            "-S",
            &start,
        ])
        .await
    }

    async fn pane_status(&self, id: &PaneId) -> Result<PaneStatus, PaneError> {
        let Some(line) = self.window_line(&id.0).await? else {
            return Ok(PaneStatus::Missing);
        };
        let fields: Vec<&str> = line.split('\t').collect();
        let dead = fields.get(1).is_some_and(|field| *field == "1");
        if dead {
            let exit_code = fields.get(2).and_then(|field| field.parse::<i32>().ok());
            Ok(PaneStatus::Dead { exit_code })
        } else {
            let pid = fields.get(3).and_then(|field| field.parse::<u32>().ok());
            Ok(PaneStatus::Running { pid })
        }
    }

    async fn open_floating(
        &self,
        command: &str,
        opts: &FloatingOpts,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError> {
        self.ensure_session().await?;
        let cwd = opts.cwd.clone().unwrap_or_else(std::env::temp_dir);
        let wrapped = wrapped_shell_command(command, &cwd, env);

        let mut args: Vec<String> = vec![
            "display-popup".to_string(),
            "-t".to_string(),
            format!("={}", self.session),
        ];
        if opts.close_on_exit {
            args.push("-E".to_string());
        }
        if let Some(width) = &opts.width {
            args.push("-w".to_string());
            args.push(width.clone());
        }
        if let Some(height) = &opts.height {
            args.push("-h".to_string());
            args.push(height.clone());
        }
        if let Some(x) = &opts.x {
            args.push("-x".to_string());
            args.push(x.clone());
        }
        if let Some(y) = &opts.y {
            args.push("-y".to_string());
            args.push(y.clone());
        }
        args.push(wrapped);

        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run(&borrowed).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // No attached client means no surface to float on.
                warn!(event = "tmux_popup_failed", name = %opts.name, error = %err);
                Err(PaneError::Spawn(err.to_string()))
            }
        }
    }

    async fn close_floating(&self, name: &str) -> Result<(), PaneError> {
        debug!(event = "tmux_popup_close", name = name);
        self.run(&["display-popup", "-C", "-t", &format!("={}", self.session)])
            .await?;
        Ok(())
    }

    fn supports_geometry(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_target_pins_session_and_name() {
        let host = TmuxPaneHost::new("sidecar-abc123");
        assert_eq!(host.window_target("api"), "=sidecar-abc123:api");
    }

    #[test]
    fn status_line_parsing() {
        // Mirrors the list-windows format string.
        let line = "api\t1\t137\t";
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[1], "1");
        assert_eq!(fields[2].parse::<i32>().ok(), Some(137));

        let alive = "api\t0\t\t4242";
        let fields: Vec<&str> = alive.split('\t').collect();
        assert_eq!(fields[1], "0");
        assert_eq!(fields[3].parse::<u32>().ok(), Some(4242));
    }
}
