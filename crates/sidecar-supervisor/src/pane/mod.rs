mod tmux;
mod window;

pub use tmux::TmuxPaneHost;
pub use window::TerminalWindowHost;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Handle to one pane inside the host. For the tmux host this is the window
/// name; for the terminal-window host it is the tracked child key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaneId(pub String);

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneStatus {
    Running { pid: Option<u32> },
    Dead { exit_code: Option<i32> },
    Missing,
}

/// Geometry hints for a floating pane. Hosts without geometry support ignore
/// them.
#[derive(Debug, Clone, Default)]
pub struct FloatingOpts {
    pub name: String,
    pub cwd: Option<std::path::PathBuf>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
    pub close_on_exit: bool,
}

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("pane host io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("failed to spawn pane: {0}")]
    Spawn(String),
    #[error("pane not found: {0}")]
    NotFound(String),
    #[error("operation not supported by this pane host: {0}")]
    Unsupported(&'static str),
}

/// Abstraction over the terminal multiplexer. Two hosts ship: panes inside a
/// private multiplexer session, and plain host-OS terminal windows.
///
/// Every pane is treated as remain-on-exit: a dead child leaves a pollable
/// exit status behind rather than vanishing.
#[async_trait]
pub trait PaneHost: Send + Sync {
    /// Spawns `command` in a new pane named `name`, inside `cwd`, with
    /// `env` merged over the inherited environment. Re-creating the first
    /// pane of a fresh session reuses the session's placeholder pane.
    async fn create_pane(
        &self,
        name: &str,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<PaneId, PaneError>;

    /// Kills whatever runs in the pane and starts a new command in place.
    async fn respawn_pane(
        &self,
        id: &PaneId,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError>;

    async fn kill_pane(&self, id: &PaneId) -> Result<(), PaneError>;

    async fn send_interrupt(&self, id: &PaneId) -> Result<(), PaneError>;

    async fn capture_pane(&self, id: &PaneId, lines: usize) -> Result<String, PaneError>;

    async fn pane_status(&self, id: &PaneId) -> Result<PaneStatus, PaneError>;

    /// Opens a floating pane for an interaction. Hosts without a native
    /// floating primitive fall back to a new terminal window with the same
    /// env injection.
    async fn open_floating(
        &self,
        command: &str,
        opts: &FloatingOpts,
        env: &BTreeMap<String, String>,
    ) -> Result<(), PaneError>;

    async fn close_floating(&self, name: &str) -> Result<(), PaneError>;

    fn supports_geometry(&self) -> bool;
}

/// Single-quotes a string for `sh -c`.
pub(crate) fn shell_quote(input: &str) -> String {
    if !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '='))
    {
        return input.to_string();
    }
    format!("'{}'", input.replace('\'', r"'\''"))
}

/// Builds `cd <cwd> && exec env K=V ... sh -c '<command>'`, the portable
/// spelling every host uses to launch a pane child.
pub(crate) fn wrapped_shell_command(
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> String {
    let mut out = String::new();
    out.push_str("cd ");
    out.push_str(&shell_quote(&cwd.to_string_lossy()));
    out.push_str(" && exec");
    if !env.is_empty() {
        out.push_str(" env");
        for (key, value) in env {
            out.push(' ');
            out.push_str(&shell_quote(&format!("{key}={value}")));
        }
    }
    out.push_str(" sh -c ");
    out.push_str(&shell_quote(command));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_passes_safe_tokens_through() {
        assert_eq!(shell_quote("npm"), "npm");
        assert_eq!(shell_quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shell_quote("K=V"), "K=V");
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn wrapped_command_includes_cwd_env_and_command() {
        let env = BTreeMap::from([("PORT".to_string(), "3000".to_string())]);
        let wrapped = wrapped_shell_command("npm run dev", Path::new("/srv/api"), &env);
        assert_eq!(
            wrapped,
            "cd /srv/api && exec env PORT=3000 sh -c 'npm run dev'"
        );
    }

    #[test]
    fn wrapped_command_without_env_skips_env_prefix() {
        let wrapped = wrapped_shell_command("ls", Path::new("/tmp"), &BTreeMap::new());
        assert_eq!(wrapped, "cd /tmp && exec sh -c ls");
    }
}
