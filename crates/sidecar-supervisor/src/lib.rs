pub mod broker;
pub mod daemon;
pub mod dispatch;
pub mod health;
pub mod pane;
pub mod ports;
pub mod process;
pub mod supervisor;
pub mod tail;
pub mod watch;

pub use broker::{InteractionBroker, InteractionRequest};
pub use dispatch::ToolDispatcher;
pub use pane::{FloatingOpts, PaneError, PaneHost, PaneId, PaneStatus};
pub use supervisor::{ReloadDiff, StartOptions, Supervisor, SupervisorConfig, SupervisorEvent};
