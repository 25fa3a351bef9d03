// Invoker Port
// Abstraction over the function-invocation endpoint

use crate::domain::InvocationResult;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Invocation client construction errors
///
/// `invoke` itself never fails; these only arise while building a client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Invalid invocation configuration: {0}")]
    Config(String),

    #[error("Failed to open invocation session: {0}")]
    Session(String),
}

impl InvocationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, InvocationError::Config(_))
    }
}

/// Invoker trait
///
/// Implementations:
/// - WhiskInvoker: HTTP POST with a self-healing session
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invoke `action` with a JSON body
    ///
    /// Transport failures come back as a result carrying an `error` field.
    async fn invoke(&self, payload_json: &str, action: &str) -> InvocationResult;
}

/// Builds one invoker per worker connection cycle
pub trait InvokerFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Invoker>, InvocationError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted invoker
    ///
    /// Returns scripted results in order, then `fallback` forever.
    pub struct MockInvoker {
        script: Mutex<VecDeque<InvocationResult>>,
        fallback: InvocationResult,
        calls: Mutex<Vec<(String, String)>>,
        latency: Option<Duration>,
    }

    impl MockInvoker {
        pub fn new(script: Vec<InvocationResult>, fallback: InvocationResult) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
                latency: None,
            }
        }

        pub fn new_success() -> Self {
            Self::new(
                Vec::new(),
                InvocationResult::new(serde_json::json!({ "activationId": "mock" })),
            )
        }

        pub fn new_failing(message: impl Into<String>) -> Self {
            Self::new(Vec::new(), InvocationResult::error(message))
        }

        /// Fail `failures` times, then succeed
        pub fn new_flaky(failures: usize) -> Self {
            let script = (0..failures)
                .map(|_| InvocationResult::error("too many in-flight activations"))
                .collect();
            Self::new(
                script,
                InvocationResult::new(serde_json::json!({ "activationId": "mock" })),
            )
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// Recorded `(payload_json, action)` pairs
        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Invoker for MockInvoker {
        async fn invoke(&self, payload_json: &str, action: &str) -> InvocationResult {
            self.calls
                .lock()
                .unwrap()
                .push((payload_json.to_string(), action.to_string()));

            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Factory sharing one `MockInvoker` across every worker
    pub struct MockInvokerFactory {
        invoker: Arc<MockInvoker>,
        created: AtomicUsize,
    }

    impl MockInvokerFactory {
        pub fn new(invoker: Arc<MockInvoker>) -> Self {
            Self {
                invoker,
                created: AtomicUsize::new(0),
            }
        }

        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl InvokerFactory for MockInvokerFactory {
        fn create(&self) -> Result<Arc<dyn Invoker>, InvocationError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let invoker: Arc<dyn Invoker> = self.invoker.clone();
            Ok(invoker)
        }
    }
}
