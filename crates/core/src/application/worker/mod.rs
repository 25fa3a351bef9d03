// Worker - one queue connection + consume loop

pub mod constants;
mod panic_guard;
mod shutdown;

use constants::*;
pub use panic_guard::{execute_guarded_async, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::handler::{HandlerSettings, MessageHandler};
use crate::domain::QueueSpec;
use crate::error::Result;
use crate::port::{InvokerFactory, QueueConnection, QueueConnector};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{error, info};

/// Worker identity, unique within one supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Listening,
    /// Backing off after a listener error
    Paused,
    Stopped,
}

/// Per-worker configuration, shared read-only across the pool
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueSpec,
    pub action: String,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub inactivity_timeout: Duration,
    pub reconnect_pause: Duration,
    pub handler: HandlerSettings,
}

impl WorkerSettings {
    pub fn new(queue: QueueSpec, action: impl Into<String>) -> Self {
        Self {
            queue,
            action: action.into(),
            connect_attempts: CONNECT_ATTEMPTS,
            connect_retry_delay: CONNECT_RETRY_DELAY,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            reconnect_pause: RECONNECT_PAUSE_DURATION,
            handler: HandlerSettings::default(),
        }
    }
}

/// Worker relays deliveries from its own connection to its own invoker
///
/// `CONNECTING -> LISTENING -> (error) -> pause -> CONNECTING`, until the
/// shutdown signal is observed or a fatal setup error ends the run.
pub struct Worker {
    id: WorkerId,
    settings: Arc<WorkerSettings>,
    connector: Arc<dyn QueueConnector>,
    invokers: Arc<dyn InvokerFactory>,
    shutdown: ShutdownToken,
    connection: Mutex<Option<Arc<dyn QueueConnection>>>,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        settings: Arc<WorkerSettings>,
        connector: Arc<dyn QueueConnector>,
        invokers: Arc<dyn InvokerFactory>,
        shutdown: ShutdownToken,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Connecting);
        Self {
            id,
            settings,
            connector,
            invokers,
            shutdown,
            connection: Mutex::new(None),
            state,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run worker loop with graceful shutdown support
    ///
    /// Returns `Ok` on shutdown and `Err` only for fatal setup errors.
    pub async fn run(&self) -> Result<()> {
        info!(worker = %self.id, queue = %self.settings.queue.name, "Worker started");
        let mut shutdown = self.shutdown.clone();

        while !shutdown.is_shutdown() {
            match self.listen().await {
                Ok(received) => {
                    info!(worker = %self.id, received, "Timed out or interrupted");
                }
                Err(e) if e.is_fatal() => {
                    error!(worker = %self.id, error = %e, "Worker cannot recover");
                    self.state.send_replace(WorkerState::Stopped);
                    return Err(e);
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Listener error");
                    if shutdown.is_shutdown() {
                        break;
                    }
                    self.state.send_replace(WorkerState::Paused);
                    tokio::select! {
                        _ = sleep(self.settings.reconnect_pause) => {}
                        _ = shutdown.wait() => {
                            info!(worker = %self.id, "Worker interrupted during reconnect pause");
                            break;
                        }
                    }
                }
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        info!(worker = %self.id, "Worker stopped");
        Ok(())
    }

    /// Interrupt the current receive loop, if any
    ///
    /// Does not end the worker by itself; pair with the shutdown signal.
    pub async fn stop(&self) {
        let connection = self.connection.lock().await.clone();
        if let Some(connection) = connection {
            connection.stop().await;
        }
    }

    /// One connection cycle; returns deliveries processed
    async fn listen(&self) -> Result<usize> {
        self.state.send_replace(WorkerState::Connecting);

        info!(worker = %self.id, "Connecting to invocation endpoint...");
        let invoker = self.invokers.create()?;

        info!(worker = %self.id, "Connecting to broker...");
        let mut shutdown = self.shutdown.clone();
        let connection = tokio::select! {
            connected = self.connector.connect(
                self.settings.connect_attempts,
                self.settings.connect_retry_delay,
            ) => connected?,
            _ = shutdown.wait() => {
                info!(worker = %self.id, "Worker interrupted while connecting");
                return Ok(0);
            }
        };
        *self.connection.lock().await = Some(Arc::clone(&connection));

        // stop() may have raced ahead of the attach above
        let result = if self.shutdown.is_shutdown() {
            Ok(0)
        } else {
            let handler = MessageHandler::new(
                invoker,
                self.settings.action.clone(),
                self.settings.handler.clone(),
                self.shutdown.clone(),
            );
            self.consume(connection.as_ref(), &handler).await
        };

        self.connection.lock().await.take();
        connection.stop().await;
        result
    }

    async fn consume(
        &self,
        connection: &dyn QueueConnection,
        handler: &MessageHandler,
    ) -> Result<usize> {
        connection.start_consuming(&self.settings.queue).await?;

        self.state.send_replace(WorkerState::Listening);
        info!(worker = %self.id, queue = %self.settings.queue.name, "Waiting on queue...");

        let received = connection
            .receive_loop(handler, self.settings.inactivity_timeout, 0)
            .await?;
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::invoker::mocks::{MockInvoker, MockInvokerFactory};
    use crate::port::message_queue::mocks::{ConnectFailure, InMemoryBroker, MockConnector};

    fn fast_settings() -> Arc<WorkerSettings> {
        let mut settings = WorkerSettings::new(QueueSpec::new("feed"), "relay");
        settings.connect_retry_delay = Duration::from_millis(1);
        settings.reconnect_pause = Duration::from_millis(10);
        settings.inactivity_timeout = Duration::from_secs(30);
        settings.handler.retry_pause = Duration::from_millis(1);
        Arc::new(settings)
    }

    fn worker(
        broker: &Arc<InMemoryBroker>,
        invoker: Arc<MockInvoker>,
        shutdown: ShutdownToken,
    ) -> Arc<Worker> {
        Arc::new(Worker::new(
            WorkerId(1),
            fast_settings(),
            Arc::new(MockConnector::new(Arc::clone(broker))),
            Arc::new(MockInvokerFactory::new(invoker)),
            shutdown,
        ))
    }

    async fn wait_for_state(worker: &Worker, wanted: WorkerState) {
        let mut states = worker.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_relays_and_acknowledges() {
        let broker = InMemoryBroker::new();
        broker.push("feed", r#"{"n":1}"#);
        broker.push("feed", r#"{"n":2}"#);

        let invoker = Arc::new(MockInvoker::new_success());
        let (tx, token) = shutdown_channel();
        let worker = worker(&broker, invoker.clone(), token);

        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        wait_for_state(&worker, WorkerState::Listening).await;
        while broker.acked() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.shutdown();
        worker.stop().await;
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(invoker.call_count(), 2);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_transient_connect_failure_reconnects() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connect(ConnectFailure::Transient);
        broker.fail_next_connect(ConnectFailure::Transient);

        let (tx, token) = shutdown_channel();
        let worker = worker(&broker, Arc::new(MockInvoker::new_success()), token);
        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        wait_for_state(&worker, WorkerState::Listening).await;
        assert_eq!(broker.connect_count(), 3);

        tx.shutdown();
        worker.stop().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fatal_connect_failure_ends_run() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connect(ConnectFailure::Fatal);

        let (_tx, token) = shutdown_channel();
        let worker = worker(&broker, Arc::new(MockInvoker::new_success()), token);

        let result = tokio::time::timeout(Duration::from_secs(2), worker.run())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_inactivity_timeout_cycles_connection() {
        let broker = InMemoryBroker::new();
        let mut settings = (*fast_settings()).clone();
        settings.inactivity_timeout = Duration::from_millis(20);

        let (tx, token) = shutdown_channel();
        let worker = Arc::new(Worker::new(
            WorkerId(7),
            Arc::new(settings),
            Arc::new(MockConnector::new(Arc::clone(&broker))),
            Arc::new(MockInvokerFactory::new(Arc::new(MockInvoker::new_success()))),
            token,
        ));
        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        while broker.connect_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.shutdown();
        worker.stop().await;
        assert!(task.await.unwrap().is_ok());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_connect() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connect(ConnectFailure::Stall);

        let (tx, token) = shutdown_channel();
        let worker = worker(&broker, Arc::new(MockInvoker::new_success()), token);
        let task = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        while broker.connect_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(worker.state(), WorkerState::Connecting);

        tx.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connect was not interrupted")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_connection_is_noop() {
        let broker = InMemoryBroker::new();
        let (_tx, token) = shutdown_channel();
        let worker = worker(&broker, Arc::new(MockInvoker::new_success()), token);

        worker.stop().await;
        assert_eq!(broker.stop_count(), 0);
        assert_eq!(worker.id().to_string(), "worker-1");
    }
}
