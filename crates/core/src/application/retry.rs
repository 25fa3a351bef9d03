// Retry logic for invocation attempts
use std::time::Duration;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the pause
    Retry(Duration),
    /// Attempt budget exhausted
    GiveUp,
}

/// Bounded, fixed-pause retry policy
///
/// Keeps a worker from hammering an overloaded invocation endpoint: at most
/// `max_attempts` calls per message, `pause` apart.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    pause: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `max_attempts` - Invocation attempts allowed per message
    /// * `pause` - Delay between consecutive attempts
    pub fn new(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts,
            pause,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what happens after `attempts_made` failed attempts
    ///
    /// # Example
    /// ```text
    /// let policy = RetryPolicy::new(3, Duration::from_secs(1));
    /// assert_eq!(policy.should_retry(1), RetryDecision::Retry(Duration::from_secs(1)));
    /// assert_eq!(policy.should_retry(3), RetryDecision::GiveUp);
    /// ```
    pub fn should_retry(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            warn!(
                attempts = attempts_made,
                max_attempts = self.max_attempts,
                "Max invocation attempts reached"
            );
            return RetryDecision::GiveUp;
        }

        info!(
            attempt = attempts_made,
            max_attempts = self.max_attempts,
            delay_ms = self.pause.as_millis() as u64,
            "Scheduling invocation retry"
        );
        RetryDecision::Retry(self.pause)
    }
}
