pub mod env;
pub mod error;
pub mod events;
pub mod ipc;
pub mod logbuf;
pub mod manifest;
pub mod session;
pub mod state;

pub use error::{ConfigError, ResolveError, ToolError};
pub use manifest::{Manifest, ProcessConfig, ResolvedProcessConfig, RestartPolicy, Settings};
pub use state::{ProcessState, ProcessStatus};
