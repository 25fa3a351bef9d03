// Message Queue Port
// Abstraction over one broker connection/channel with bounded-prefetch consumption

use crate::domain::QueueSpec;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Coordinates can never work (bad CA file, malformed vhost); not retried
    #[error("Invalid broker configuration: {0}")]
    Config(String),

    #[error("Broker unreachable after {attempts} attempt(s): {reason}")]
    Connection { attempts: u32, reason: String },

    #[error("Broker operation failed: {0}")]
    Broker(String),

    #[error("No queue started on this connection")]
    NotConsuming,
}

impl QueueError {
    /// Fatal errors end the owning worker instead of triggering a reconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Config(_))
    }
}

/// Callback invoked for each delivery; `true` acknowledges it
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> bool;
}

/// Opens broker connections from shared, read-only coordinates
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Connect and open a channel, retrying up to `attempts` times
    ///
    /// # Errors
    /// - QueueError::Connection once every attempt failed
    /// - QueueError::Config if the coordinates can never succeed
    async fn connect(
        &self,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Arc<dyn QueueConnection>, QueueError>;
}

/// One live connection + channel
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Declare the queue, bound prefetch to `PREFETCH_COUNT` and optionally purge it
    ///
    /// Missing consume permissions only surface once `receive_loop` starts.
    async fn start_consuming(&self, queue: &QueueSpec) -> Result<(), QueueError>;

    /// Consume deliveries one at a time until `max_messages` (0 = unbounded),
    /// `inactivity_timeout` without traffic, or `stop()`
    ///
    /// Each delivery is acknowledged iff `handler` returns true.
    /// Returns the number of deliveries processed.
    async fn receive_loop(
        &self,
        handler: &dyn DeliveryHandler,
        inactivity_timeout: Duration,
        max_messages: usize,
    ) -> Result<usize, QueueError>;

    /// Publish with persistent delivery mode
    ///
    /// `None` targets the queue passed to `start_consuming`.
    async fn publish(&self, payload: &[u8], queue: Option<&str>) -> Result<(), QueueError>;

    /// Cancel consumption and close channel/connection
    ///
    /// Idempotent, never fails, and unblocks a `receive_loop` running elsewhere.
    async fn stop(&self);

    /// Deliveries received on this connection
    fn inbound(&self) -> u64;

    /// Messages published on this connection
    fn outbound(&self) -> u64;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::application::worker::constants::PREFETCH_COUNT;
    use crate::application::worker::{shutdown_channel, ShutdownSender, ShutdownToken};
    use crate::domain::InFlightMessage;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Outcome forced on an upcoming `connect` call
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConnectFailure {
        /// Broker unreachable (worker pauses and reconnects)
        Transient,
        /// Configuration rejected (worker exits)
        Fatal,
        /// `connect` panics (worker crashes)
        Panic,
        /// `connect` never completes (broker retries in progress)
        Stall,
    }

    /// In-memory broker shared by every mock connection
    #[derive(Default)]
    pub struct InMemoryBroker {
        queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
        arrivals: Notify,
        failures: Mutex<VecDeque<ConnectFailure>>,
        persistent_failure: Mutex<Option<ConnectFailure>>,
        connects: AtomicUsize,
        open_connections: AtomicUsize,
        stops: AtomicUsize,
        acked: AtomicU64,
        outstanding: AtomicUsize,
        max_unacked: AtomicUsize,
    }

    impl InMemoryBroker {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) {
            self.queues
                .lock()
                .unwrap()
                .entry(queue.to_string())
                .or_default()
                .push_back(payload.into());
            self.arrivals.notify_waiters();
        }

        pub fn depth(&self, queue: &str) -> usize {
            self.queues
                .lock()
                .unwrap()
                .get(queue)
                .map(VecDeque::len)
                .unwrap_or(0)
        }

        pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
            self.queues
                .lock()
                .unwrap()
                .get(queue)
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default()
        }

        /// Queue a forced outcome for the next `connect` call
        pub fn fail_next_connect(&self, failure: ConnectFailure) {
            self.failures.lock().unwrap().push_back(failure);
        }

        /// Force the same outcome on every `connect` once the queued ones are used up
        pub fn fail_every_connect(&self, failure: ConnectFailure) {
            *self.persistent_failure.lock().unwrap() = Some(failure);
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn open_connections(&self) -> usize {
            self.open_connections.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        pub fn acked(&self) -> u64 {
            self.acked.load(Ordering::SeqCst)
        }

        /// Deliveries handed out and neither acknowledged nor requeued, all connections
        pub fn outstanding(&self) -> usize {
            self.outstanding.load(Ordering::SeqCst)
        }

        /// Highest number of unacknowledged deliveries a single connection held
        pub fn max_unacked(&self) -> usize {
            self.max_unacked.load(Ordering::SeqCst)
        }

        fn declare(&self, queue: &str, purge: bool) {
            let mut queues = self.queues.lock().unwrap();
            let entry = queues.entry(queue.to_string()).or_default();
            if purge {
                entry.clear();
            }
        }

        fn pop(&self, queue: &str) -> Option<Vec<u8>> {
            self.queues
                .lock()
                .unwrap()
                .get_mut(queue)
                .and_then(VecDeque::pop_front)
        }

        fn requeue(&self, queue: &str, payload: Vec<u8>) {
            self.queues
                .lock()
                .unwrap()
                .entry(queue.to_string())
                .or_default()
                .push_front(payload);
            self.arrivals.notify_waiters();
        }
    }

    /// Connector handing out connections to an `InMemoryBroker`
    pub struct MockConnector {
        broker: Arc<InMemoryBroker>,
    }

    impl MockConnector {
        pub fn new(broker: Arc<InMemoryBroker>) -> Self {
            Self { broker }
        }
    }

    #[async_trait]
    impl QueueConnector for MockConnector {
        async fn connect(
            &self,
            attempts: u32,
            _retry_delay: Duration,
        ) -> Result<Arc<dyn QueueConnection>, QueueError> {
            self.broker.connects.fetch_add(1, Ordering::SeqCst);

            let queued = self.broker.failures.lock().unwrap().pop_front();
            let failure = queued.or(*self.broker.persistent_failure.lock().unwrap());
            match failure {
                Some(ConnectFailure::Transient) => Err(QueueError::Connection {
                    attempts,
                    reason: "mock broker unreachable".to_string(),
                }),
                Some(ConnectFailure::Fatal) => Err(QueueError::Config(
                    "mock broker rejected the coordinates".to_string(),
                )),
                Some(ConnectFailure::Panic) => panic!("mock broker connection panicked"),
                Some(ConnectFailure::Stall) => std::future::pending().await,
                None => {
                    self.broker.open_connections.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(MockConnection::new(Arc::clone(&self.broker))))
                }
            }
        }
    }

    /// Connection enforcing the prefetch bound against the shared broker
    ///
    /// Deliveries the handler rejects stay unacknowledged; once `PREFETCH_COUNT`
    /// are held no further delivery is made until the connection stops and the
    /// broker requeues them.
    pub struct MockConnection {
        broker: Arc<InMemoryBroker>,
        queue: Mutex<Option<QueueSpec>>,
        unacked: Mutex<VecDeque<(u64, Vec<u8>)>>,
        next_tag: AtomicU64,
        inbound: AtomicU64,
        outbound: AtomicU64,
        stop_tx: ShutdownSender,
        stop_rx: ShutdownToken,
        closed: AtomicBool,
    }

    impl MockConnection {
        fn new(broker: Arc<InMemoryBroker>) -> Self {
            let (stop_tx, stop_rx) = shutdown_channel();
            Self {
                broker,
                queue: Mutex::new(None),
                unacked: Mutex::new(VecDeque::new()),
                next_tag: AtomicU64::new(1),
                inbound: AtomicU64::new(0),
                outbound: AtomicU64::new(0),
                stop_tx,
                stop_rx,
                closed: AtomicBool::new(false),
            }
        }

        fn queue_name(&self) -> Result<String, QueueError> {
            self.queue
                .lock()
                .unwrap()
                .as_ref()
                .map(|q| q.name.clone())
                .ok_or(QueueError::NotConsuming)
        }

        fn take_delivery(&self, queue: &str) -> Option<InFlightMessage> {
            let mut unacked = self.unacked.lock().unwrap();
            if unacked.len() >= usize::from(PREFETCH_COUNT) {
                return None;
            }
            let payload = self.broker.pop(queue)?;
            let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            unacked.push_back((delivery_tag, payload.clone()));
            self.broker.outstanding.fetch_add(1, Ordering::SeqCst);
            self.broker
                .max_unacked
                .fetch_max(unacked.len(), Ordering::SeqCst);
            Some(InFlightMessage {
                delivery_tag,
                payload,
            })
        }

        fn ack(&self, delivery_tag: u64) {
            self.unacked
                .lock()
                .unwrap()
                .retain(|(tag, _)| *tag != delivery_tag);
            self.broker.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.broker.acked.fetch_add(1, Ordering::SeqCst);
        }

        async fn next_delivery(
            &self,
            queue: &str,
            stop: &mut ShutdownToken,
            inactivity_timeout: Duration,
        ) -> Option<InFlightMessage> {
            let deadline = tokio::time::Instant::now() + inactivity_timeout;
            loop {
                if stop.is_shutdown() {
                    return None;
                }

                let arrival = self.broker.arrivals.notified();
                tokio::pin!(arrival);
                arrival.as_mut().enable();

                if let Some(message) = self.take_delivery(queue) {
                    return Some(message);
                }

                tokio::select! {
                    _ = &mut arrival => {}
                    _ = stop.wait() => return None,
                    _ = tokio::time::sleep_until(deadline) => return None,
                }
            }
        }
    }

    #[async_trait]
    impl QueueConnection for MockConnection {
        async fn start_consuming(&self, queue: &QueueSpec) -> Result<(), QueueError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Broker("channel closed".to_string()));
            }
            self.broker.declare(&queue.name, queue.purge);
            *self.queue.lock().unwrap() = Some(queue.clone());
            Ok(())
        }

        async fn receive_loop(
            &self,
            handler: &dyn DeliveryHandler,
            inactivity_timeout: Duration,
            max_messages: usize,
        ) -> Result<usize, QueueError> {
            let queue = self.queue_name()?;
            let mut stop = self.stop_rx.clone();
            let mut received = 0;

            while let Some(message) = self.next_delivery(&queue, &mut stop, inactivity_timeout).await {
                received += 1;
                self.inbound.fetch_add(1, Ordering::SeqCst);

                if handler.handle(&message.payload).await {
                    self.ack(message.delivery_tag);
                }

                if received == max_messages {
                    break;
                }
            }

            Ok(received)
        }

        async fn publish(&self, payload: &[u8], queue: Option<&str>) -> Result<(), QueueError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Broker("channel closed".to_string()));
            }
            let target = match queue {
                Some(name) => name.to_string(),
                None => self.queue_name()?,
            };
            self.broker.push(&target, payload.to_vec());
            self.outbound.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.broker.stops.fetch_add(1, Ordering::SeqCst);
            self.stop_tx.shutdown();

            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            // Closing the channel hands unacknowledged deliveries back in order
            let held: Vec<_> = self.unacked.lock().unwrap().drain(..).collect();
            if let Ok(queue) = self.queue_name() {
                for (_, payload) in held.into_iter().rev() {
                    self.broker.outstanding.fetch_sub(1, Ordering::SeqCst);
                    self.broker.requeue(&queue, payload);
                }
            }
            self.broker.open_connections.fetch_sub(1, Ordering::SeqCst);
        }

        fn inbound(&self) -> u64 {
            self.inbound.load(Ordering::SeqCst)
        }

        fn outbound(&self) -> u64 {
            self.outbound.load(Ordering::SeqCst)
        }
    }
}
