use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The port announcements dev servers actually print, most specific first.
static PORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Local:\s+https?://localhost:(\d{2,5})",
        r"https?://localhost:(\d{2,5})",
        r"(?i)listening on port (\d{2,5})",
        r"(?i)server[^\r\n]*?:(\d{2,5})",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// First port a log line announces, if any.
pub fn detect_port(line: &str) -> Option<u16> {
    for pattern in PORT_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(line) {
            if let Ok(port) = caps[1].parse::<u16>() {
                if port > 0 {
                    return Some(port);
                }
            }
        }
    }
    None
}

pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Best-effort reclamation of a port held by a foreign process: SIGTERM the
/// holders, give them a short grace period, then SIGKILL. Pids in `own_pids`
/// are never touched. Returns whether the port is free afterwards.
pub async fn free_port(port: u16, own_pids: &HashSet<u32>) -> std::io::Result<bool> {
    if port_is_free(port) {
        return Ok(true);
    }

    let holders: Vec<u32> = holders_of(port)
        .await?
        .into_iter()
        .filter(|pid| !own_pids.contains(pid))
        .collect();
    if holders.is_empty() {
        return Ok(port_is_free(port));
    }

    info!(event = "port_reclaim", port, pids = ?holders);
    signal_all(&holders, false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    if port_is_free(port) {
        return Ok(true);
    }
    warn!(event = "port_reclaim_escalate", port, pids = ?holders);
    signal_all(&holders, true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(port_is_free(port))
}

async fn holders_of(port: u16) -> std::io::Result<Vec<u32>> {
    let output = tokio::process::Command::new("lsof")
        .args(["-ti", &format!(":{port}")])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect())
}

#[cfg(unix)]
fn signal_all(pids: &[u32], force: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    for pid in pids {
        debug!(event = "port_reclaim_signal", pid, signal = ?signal);
        let _ = kill(Pid::from_raw(*pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_all(_pids: &[u32], _force: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_localhost_urls() {
        assert_eq!(detect_port("Listening on http://localhost:5173"), Some(5173));
        assert_eq!(detect_port("ready at https://localhost:8443/"), Some(8443));
    }

    #[test]
    fn detects_vite_local_line() {
        assert_eq!(
            detect_port("  ➜  Local:   http://localhost:4321/"),
            Some(4321)
        );
    }

    #[test]
    fn detects_listening_on_port() {
        assert_eq!(detect_port("app listening on port 3000"), Some(3000));
        assert_eq!(detect_port("Listening On Port 9001"), Some(9001));
    }

    #[test]
    fn detects_server_colon_port() {
        assert_eq!(detect_port("Server running at 0.0.0.0:8080"), Some(8080));
    }

    #[test]
    fn ignores_lines_without_ports() {
        assert_eq!(detect_port("compiled successfully"), None);
        assert_eq!(detect_port("requests: 12, errors: 0"), None);
    }
}
