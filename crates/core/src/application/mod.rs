// Application Layer - Relay use cases

pub mod handler;
pub mod retry;
pub mod supervisor;
pub mod worker;

// Re-exports
pub use handler::{HandlerError, HandlerSettings, MessageHandler, RelayOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use supervisor::{Supervisor, SupervisorReport, SupervisorSettings, SupervisorStats};
pub use worker::{
    shutdown_channel, ShutdownSender, ShutdownToken, Worker, WorkerId, WorkerSettings, WorkerState,
};
