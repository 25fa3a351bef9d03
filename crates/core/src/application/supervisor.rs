// Supervisor - fixed-size worker pool with crash replacement and graceful drain

use crate::application::worker::constants::*;
use crate::application::worker::{
    execute_guarded_async, shutdown_channel, PanicGuardResult, ShutdownSender, ShutdownToken,
    Worker, WorkerId, WorkerSettings,
};
use crate::error::Result;
use crate::port::{InvokerFactory, QueueConnector};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Pool sizing and shutdown bounds
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub num_workers: usize,
    /// Delay before a replacement worker connects
    pub restart_pause: Duration,
    pub monitor_interval: Duration,
    pub stop_timeout: Duration,
    pub drain_timeout: Duration,
}

impl SupervisorSettings {
    /// `num_workers` is capped at `MAX_WORKERS`
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.min(MAX_WORKERS),
            restart_pause: WORKER_RESTART_PAUSE,
            monitor_interval: MONITOR_INTERVAL,
            stop_timeout: WORKER_STOP_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

/// Live pool counters, readable while the supervisor runs
#[derive(Debug, Default)]
pub struct SupervisorStats {
    launched: AtomicUsize,
    replaced: AtomicUsize,
    running: AtomicUsize,
}

impl SupervisorStats {
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn replaced(&self) -> usize {
        self.replaced.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

/// Totals reported once the pool has drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub launched: usize,
    pub replaced: usize,
    /// Workers whose `stop()` was called during shutdown
    pub stopped: usize,
    /// Tasks aborted because they outlived the drain timeout
    pub aborted: usize,
}

type Joined = std::result::Result<(task::Id, (WorkerId, WorkerExit)), JoinError>;

/// How a worker task ended
#[derive(Debug)]
enum WorkerExit {
    Finished(Result<()>),
    Panicked(String),
}

/// Supervisor keeps `num_workers` workers running until termination
pub struct Supervisor {
    settings: SupervisorSettings,
    worker_settings: Arc<WorkerSettings>,
    connector: Arc<dyn QueueConnector>,
    invokers: Arc<dyn InvokerFactory>,
    shutdown_tx: ShutdownSender,
    shutdown: ShutdownToken,
    workers: HashMap<WorkerId, Arc<Worker>>,
    task_ids: HashMap<task::Id, WorkerId>,
    tasks: JoinSet<(WorkerId, WorkerExit)>,
    next_id: u64,
    stats: Arc<SupervisorStats>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        worker_settings: WorkerSettings,
        connector: Arc<dyn QueueConnector>,
        invokers: Arc<dyn InvokerFactory>,
    ) -> Self {
        let (shutdown_tx, shutdown) = shutdown_channel();
        Self {
            settings,
            worker_settings: Arc::new(worker_settings),
            connector,
            invokers,
            shutdown_tx,
            shutdown,
            workers: HashMap::new(),
            task_ids: HashMap::new(),
            tasks: JoinSet::new(),
            next_id: 0,
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    /// Token observing the pool-wide shutdown signal
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Run the pool until `terminate` resolves, then drain it
    ///
    /// A worker task finishing before termination is always abnormal; it is
    /// logged and replaced so the pool keeps its configured size.
    pub async fn run<F>(mut self, terminate: F) -> SupervisorReport
    where
        F: Future<Output = ()>,
    {
        info!(
            workers = self.settings.num_workers,
            queue = %self.worker_settings.queue.name,
            action = %self.worker_settings.action,
            "Starting workers..."
        );
        self.fill_pool();

        tokio::pin!(terminate);
        loop {
            tokio::select! {
                _ = &mut terminate => {
                    info!("Termination requested");
                    break;
                }
                joined = timeout(self.settings.monitor_interval, self.tasks.join_next_with_id()) => {
                    match joined {
                        Err(_) => {
                            info!(running = self.tasks.len(), "Pool health");
                        }
                        Ok(Some(joined)) => self.on_joined(joined),
                        Ok(None) => {
                            warn!("No worker tasks running");
                        }
                    }
                    self.fill_pool();
                }
            }
        }

        let (stopped, aborted) = self.shutdown().await;
        SupervisorReport {
            launched: self.stats.launched(),
            replaced: self.stats.replaced(),
            stopped,
            aborted,
        }
    }

    fn on_joined(&mut self, joined: Joined) {
        match joined {
            Ok((task_id, (id, exit))) => {
                self.task_ids.remove(&task_id);
                self.on_worker_exit(id, exit);
            }
            Err(join_err) => match self.task_ids.remove(&join_err.id()) {
                Some(id) => {
                    self.workers.remove(&id);
                    self.stats.running.store(self.tasks.len(), Ordering::SeqCst);
                    error!(worker = %id, error = %join_err, "Worker task cancelled; starting replacement...");
                }
                None => error!(error = %join_err, "Unknown worker task cancelled"),
            },
        }
    }

    fn on_worker_exit(&mut self, id: WorkerId, exit: WorkerExit) {
        self.workers.remove(&id);
        self.stats.running.store(self.tasks.len(), Ordering::SeqCst);

        match exit {
            WorkerExit::Finished(Ok(())) => {
                error!(worker = %id, "Worker stopped; starting replacement...");
            }
            WorkerExit::Finished(Err(e)) => {
                error!(worker = %id, error = %e, "Worker failed; starting replacement...");
            }
            WorkerExit::Panicked(msg) => {
                error!(worker = %id, panic_msg = %msg, "Worker crashed; starting replacement...");
            }
        }
    }

    /// Launch workers until the pool is at its configured size
    ///
    /// Replacements wait `restart_pause` before connecting.
    fn fill_pool(&mut self) {
        let initial = self.stats.launched() == 0;
        let delay = if initial {
            Duration::ZERO
        } else {
            self.settings.restart_pause
        };
        while self.workers.len() < self.settings.num_workers {
            self.launch(delay);
            if !initial {
                self.stats.replaced.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn launch(&mut self, delay: Duration) {
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        let worker = Arc::new(Worker::new(
            id,
            Arc::clone(&self.worker_settings),
            Arc::clone(&self.connector),
            Arc::clone(&self.invokers),
            self.shutdown.clone(),
        ));

        let task_worker = Arc::clone(&worker);
        let mut shutdown = self.shutdown.clone();
        let handle = self.tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.wait() => return (id, WorkerExit::Finished(Ok(()))),
                }
            }
            let exit = match execute_guarded_async(task_worker.run()).await {
                PanicGuardResult::Success(result) => WorkerExit::Finished(result),
                PanicGuardResult::Panicked(msg) => WorkerExit::Panicked(msg),
            };
            (id, exit)
        });

        self.task_ids.insert(handle.id(), id);
        self.workers.insert(id, worker);
        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        self.stats.running.store(self.tasks.len(), Ordering::SeqCst);
    }

    /// Signal shutdown, stop every live worker, wait for the pool to drain
    ///
    /// Returns the workers stopped and the tasks aborted after the drain timeout.
    async fn shutdown(&mut self) -> (usize, usize) {
        info!(running = self.tasks.len(), "Stopping...");
        self.shutdown_tx.shutdown();

        let mut stopped = 0;
        for (id, worker) in &self.workers {
            stopped += 1;
            if timeout(self.settings.stop_timeout, worker.stop()).await.is_err() {
                warn!(worker = %id, "Worker did not stop in time; continuing");
            }
        }

        let tasks = &mut self.tasks;
        let drained = timeout(self.settings.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((id, WorkerExit::Finished(Ok(())))) => info!(worker = %id, "Worker drained"),
                    Ok((id, WorkerExit::Finished(Err(e)))) => {
                        warn!(worker = %id, error = %e, "Worker exited with error during shutdown")
                    }
                    Ok((id, WorkerExit::Panicked(msg))) => {
                        warn!(worker = %id, panic_msg = %msg, "Worker panicked during shutdown")
                    }
                    Err(join_err) => warn!(error = %join_err, "Worker task failed during shutdown"),
                }
            }
        })
        .await;

        let aborted = if drained.is_err() {
            let remaining = self.tasks.len();
            warn!(remaining, "Pool did not drain in time; aborting remaining workers");
            self.tasks.shutdown().await;
            remaining
        } else {
            0
        };

        self.workers.clear();
        self.task_ids.clear();
        self.stats.running.store(0, Ordering::SeqCst);
        info!("Stopped.");
        (stopped, aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueSpec;
    use crate::port::invoker::mocks::{MockInvoker, MockInvokerFactory};
    use crate::port::message_queue::mocks::{ConnectFailure, InMemoryBroker, MockConnector};
    use tokio::sync::oneshot;

    fn worker_settings() -> WorkerSettings {
        let mut settings = WorkerSettings::new(QueueSpec::new("feed"), "relay");
        settings.connect_retry_delay = Duration::from_millis(1);
        settings.reconnect_pause = Duration::from_millis(10);
        settings.handler.retry_pause = Duration::from_millis(1);
        settings
    }

    fn supervisor(broker: &Arc<InMemoryBroker>, num_workers: usize) -> Supervisor {
        let mut settings = SupervisorSettings::new(num_workers);
        settings.restart_pause = Duration::from_millis(10);
        settings.monitor_interval = Duration::from_millis(50);
        settings.stop_timeout = Duration::from_millis(500);
        settings.drain_timeout = Duration::from_secs(2);
        Supervisor::new(
            settings,
            worker_settings(),
            Arc::new(MockConnector::new(Arc::clone(broker))),
            Arc::new(MockInvokerFactory::new(Arc::new(MockInvoker::new_success()))),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[test]
    fn test_worker_count_capped() {
        assert_eq!(SupervisorSettings::new(100).num_workers, MAX_WORKERS);
        assert_eq!(SupervisorSettings::new(4).num_workers, 4);
    }

    #[tokio::test]
    async fn test_launches_configured_pool_and_drains() {
        let broker = InMemoryBroker::new();
        let supervisor = supervisor(&broker, 3);
        let stats = supervisor.stats();
        let (term_tx, term_rx) = oneshot::channel::<()>();

        let run = tokio::spawn(supervisor.run(async {
            let _ = term_rx.await;
        }));

        wait_until(|| broker.open_connections() == 3).await;
        assert_eq!(stats.running(), 3);

        term_tx.send(()).unwrap();
        let report = run.await.unwrap();

        assert_eq!(report.launched, 3);
        assert_eq!(report.replaced, 0);
        assert_eq!(report.stopped, 3);
        assert_eq!(report.aborted, 0);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(stats.running(), 0);
    }

    #[tokio::test]
    async fn test_failed_worker_is_replaced_once() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connect(ConnectFailure::Fatal);

        let supervisor = supervisor(&broker, 2);
        let stats = supervisor.stats();
        let (term_tx, term_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(supervisor.run(async {
            let _ = term_rx.await;
        }));

        wait_until(|| stats.replaced() == 1 && broker.open_connections() == 2).await;
        assert_eq!(stats.launched(), 3);
        assert_eq!(stats.running(), 2);

        term_tx.send(()).unwrap();
        let report = run.await.unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(report.launched, 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_restarts_are_paced() {
        let broker = InMemoryBroker::new();
        broker.fail_every_connect(ConnectFailure::Fatal);

        let mut supervisor = supervisor(&broker, 1);
        supervisor.settings.restart_pause = Duration::from_millis(50);
        let run = supervisor.run(tokio::time::sleep(Duration::from_millis(300)));
        let report = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("supervisor did not drain");

        // One launch up front, then at most one per restart pause
        assert!(report.launched >= 2);
        assert!(report.launched <= 8, "launched {}", report.launched);
        assert!(broker.connect_count() <= 8);
        assert_eq!(report.replaced, report.launched - 1);
        assert_eq!(report.aborted, 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_replaced() {
        let broker = InMemoryBroker::new();
        let mut supervisor = supervisor(&broker, 2);
        supervisor.fill_pool();
        supervisor.tasks.abort_all();

        let joined = supervisor.tasks.join_next_with_id().await.unwrap();
        assert!(matches!(&joined, Err(e) if e.is_cancelled()));

        supervisor.on_joined(joined);
        assert_eq!(supervisor.workers.len(), 1);
        assert_eq!(supervisor.task_ids.len(), 1);

        supervisor.fill_pool();
        assert_eq!(supervisor.workers.len(), 2);
        assert_eq!(supervisor.stats.replaced(), 1);
        assert_eq!(supervisor.stats.launched(), 3);

        let (stopped, aborted) = supervisor.shutdown().await;
        assert_eq!(stopped, 2);
        assert_eq!(aborted, 0);
    }
}
