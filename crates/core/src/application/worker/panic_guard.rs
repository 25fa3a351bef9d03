// Panic isolation for worker tasks
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed
    Success(T),
    /// Execution panicked
    Panicked(String),
}

/// Run a future, turning a panic into `PanicGuardResult::Panicked`
///
/// Keeps a panicking worker from taking the supervisor down with it.
pub async fn execute_guarded_async<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => PanicGuardResult::Success(result),
        Err(panic_info) => {
            let panic_msg = panic_message(panic_info.as_ref());
            error!(panic_msg = %panic_msg, "Worker task panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
