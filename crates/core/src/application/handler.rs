// Message Handler - per-delivery relay policy
// Size check, envelope framing, bounded invocation retries, ack decision

use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::worker::constants::*;
use crate::application::worker::ShutdownToken;
use crate::domain::{payload_preview, InvocationEnvelope, InvocationResult};
use crate::port::{DeliveryHandler, Invoker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info};

/// Errors raised while preparing a delivery for invocation
#[derive(Error, Debug)]
pub enum HandlerError {
    /// BufferError: the payload is never sent, retried or acknowledged
    #[error("Message payload too large; {size} > {limit} bytes!")]
    Oversize { size: usize, limit: usize },

    #[error("Message payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Failed to frame message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Handler tuning
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub max_retries: u32,
    pub retry_pause: Duration,
    pub max_message_bytes: usize,
    pub preview_bytes: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_pause: RETRY_PAUSE_DURATION,
            max_message_bytes: MAX_MESSAGE_BYTES,
            preview_bytes: PAYLOAD_PREVIEW_BYTES,
        }
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    /// Invocation calls made
    pub attempts: u32,
    /// Result of the last call, if any was made
    pub result: Option<InvocationResult>,
}

impl RelayOutcome {
    pub fn succeeded(&self) -> bool {
        self.result
            .as_ref()
            .map(InvocationResult::is_success)
            .unwrap_or(false)
    }

    /// Failed attempts
    pub fn retries(&self) -> u32 {
        self.attempts - u32::from(self.succeeded())
    }

    /// Acknowledge only a first-attempt success
    ///
    /// A message that needed retries is left unacknowledged even when a later
    /// attempt succeeded, so the broker may redeliver it (at-least-once).
    pub fn should_acknowledge(&self) -> bool {
        self.attempts == 1 && self.succeeded()
    }
}

/// Relays one delivery to the invocation endpoint
pub struct MessageHandler {
    invoker: Arc<dyn Invoker>,
    action: String,
    settings: HandlerSettings,
    retry_policy: RetryPolicy,
    shutdown: ShutdownToken,
}

impl MessageHandler {
    pub fn new(
        invoker: Arc<dyn Invoker>,
        action: impl Into<String>,
        settings: HandlerSettings,
        shutdown: ShutdownToken,
    ) -> Self {
        let retry_policy = RetryPolicy::new(settings.max_retries, settings.retry_pause);
        Self {
            invoker,
            action: action.into(),
            settings,
            retry_policy,
            shutdown,
        }
    }

    /// Frame the payload and invoke the action, retrying on `error` results
    ///
    /// Stops early once the shutdown signal is set.
    pub async fn relay(&self, payload: &[u8]) -> Result<RelayOutcome, HandlerError> {
        let size = payload.len();
        if size > self.settings.max_message_bytes {
            return Err(HandlerError::Oversize {
                size,
                limit: self.settings.max_message_bytes,
            });
        }

        let text = std::str::from_utf8(payload)?;
        let body = InvocationEnvelope::new(text).to_json()?;

        let mut shutdown = self.shutdown.clone();
        let mut outcome = RelayOutcome {
            attempts: 0,
            result: None,
        };

        while outcome.attempts < self.retry_policy.max_attempts() && !shutdown.is_shutdown() {
            let result = self.invoker.invoke(&body, &self.action).await;
            outcome.attempts += 1;
            outcome.result = Some(result);

            if outcome.succeeded() {
                break;
            }

            match self.retry_policy.should_retry(outcome.attempts) {
                RetryDecision::GiveUp => break,
                RetryDecision::Retry(pause) => {
                    tokio::select! {
                        _ = sleep(pause) => {}
                        _ = shutdown.wait() => {
                            info!(action = %self.action, "Invocation retries interrupted by shutdown");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            action = %self.action,
            retries = outcome.retries(),
            result = ?outcome.result.as_ref().map(InvocationResult::as_value),
            "Response"
        );

        Ok(outcome)
    }
}

#[async_trait]
impl DeliveryHandler for MessageHandler {
    async fn handle(&self, payload: &[u8]) -> bool {
        match self.relay(payload).await {
            Ok(outcome) => outcome.should_acknowledge(),
            Err(e) => {
                error!(
                    error = %e,
                    size = payload.len(),
                    preview = %payload_preview(payload, self.settings.preview_bytes),
                    "Message error"
                );
                false
            }
        }
    }
}
