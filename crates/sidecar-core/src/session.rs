use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SOCKET_PREFIX: &str = "sidecar";

/// Stable identity of one workspace, used as the reuse key: the socket
/// address, the multiplexer session name, and the runtime directory all
/// derive from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    hash: String,
}

impl SessionIdentity {
    /// `hash12(realpath(config_dir) [+ ":" + reuse_key])`.
    pub fn derive(config_dir: &Path, reuse_key: Option<&str>) -> std::io::Result<Self> {
        let canonical = std::fs::canonicalize(config_dir)
            .unwrap_or_else(|_| config_dir.to_path_buf());
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        if let Some(key) = reuse_key {
            hasher.update(b":");
            hasher.update(key.as_bytes());
        }
        let digest = hasher.finalize();
        let hash = digest
            .iter()
            .take(6)
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        Ok(Self { hash })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// `sidecar-<hash12>` — also used as the multiplexer session name.
    pub fn session_name(&self) -> String {
        format!("{SOCKET_PREFIX}-{}", self.hash)
    }

    pub fn socket_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}.sock", self.session_name()))
    }

    /// Windows named-pipe spelling of the same identity.
    pub fn pipe_name(&self) -> String {
        format!(r"\\.\pipe\{}", self.session_name())
    }

    pub fn runtime_dir(&self) -> PathBuf {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        base.join(SOCKET_PREFIX).join(&self.hash)
    }

    pub fn events_file(&self) -> PathBuf {
        self.runtime_dir().join("events.jsonl")
    }
}
