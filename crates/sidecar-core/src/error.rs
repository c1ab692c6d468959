use thiserror::Error;

/// Manifest-level problems. Fatal at load time; the previous manifest (if
/// any) stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read manifest: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("process '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("process '{process}' depends on unknown process '{target}'")]
    UnknownDependency { process: String, target: String },
    #[error("process '{0}' depends on itself")]
    SelfDependency(String),
    #[error("circular dependency: {0}")]
    CircularDependency(String),
    #[error("process '{process}': envFile '{path}' escapes the workspace directory")]
    EnvFileOutsideWorkspace { process: String, path: String },
    #[error("process '{process}': invalid pattern for '{var}': {source}")]
    InvalidPattern {
        process: String,
        var: String,
        source: regex::Error,
    },
}

/// A command or env template referenced a value that is not available yet.
/// Non-fatal: the process stays `pending` and the caller gets the error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),
    #[error("$PORT referenced but no port is assigned")]
    MissingPort,
}

/// Errors surfaced through the tool dispatcher. These are returned to the
/// caller as `{ok:false,error}` envelopes, never panics.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("process already running: {0}")]
    AlreadyRunning(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("pane host unavailable: {0}")]
    HostUnavailable(String),
    #[error("dependency '{dependency}' of '{process}' is not ready")]
    DependencyNotReady { process: String, dependency: String },
    #[error("{0}")]
    Unresolved(#[from] ResolveError),
    #[error("{0}")]
    Internal(String),
}
