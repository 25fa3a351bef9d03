// Relay constants (No magic values); all are defaults, overridable via settings
use std::time::Duration;

/// Largest payload relayed to the invocation endpoint (5 MiB)
pub const MAX_MESSAGE_BYTES: usize = 5 * 1024 * 1024;

/// Payload bytes included in error logs
pub const PAYLOAD_PREVIEW_BYTES: usize = 1000;

/// Invocation attempts per message
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Pause between invocation attempts (1s)
pub const RETRY_PAUSE_DURATION: Duration = Duration::from_secs(1);

/// Consume call returns after this long without traffic (1 hour)
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Pause after a listener error before reconnecting (2s)
pub const RECONNECT_PAUSE_DURATION: Duration = Duration::from_secs(2);

/// Unacknowledged deliveries a consumer may hold
pub const PREFETCH_COUNT: u16 = 1;

/// Broker connect attempts per connection cycle
pub const CONNECT_ATTEMPTS: u32 = 10;

/// Delay between broker connect attempts (1s)
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on concurrent workers
pub const MAX_WORKERS: usize = 32;

/// Delay before a replacement worker starts after an abnormal exit (2s)
pub const WORKER_RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Supervisor wakes at least this often to report pool health (1 hour)
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(3600);

/// Bound on a single worker's stop during shutdown (5s)
pub const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for the pool to drain before aborting (30s)
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
