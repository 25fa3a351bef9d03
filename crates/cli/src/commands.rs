//! Diagnostic operations over a `QueueConnector`

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tabled::Tabled;
use tracing::info;

use rabbitwhisk_core::domain::{payload_preview, QueueSpec};
use rabbitwhisk_core::port::{DeliveryHandler, QueueConnector};

/// Single attempt; diagnostics report failures instead of waiting them out
const CONNECT_ATTEMPTS: u32 = 1;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const PREVIEW_BYTES: usize = 200;

pub const ROUND_TRIP_REQUEST: &str = r#"{"serviceRequest":"none"}"#;

#[derive(Debug, Clone, PartialEq, Tabled)]
pub struct RoundTripReport {
    pub dispatched: u64,
    pub received: u64,
    #[tabled(display_with = "display_seconds")]
    pub elapsed: Duration,
}

fn display_seconds(elapsed: &Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

/// Acknowledges everything; optionally echoes a preview of each body
struct Collector {
    echo: bool,
    seen: AtomicUsize,
}

impl Collector {
    fn new(echo: bool) -> Self {
        Self {
            echo,
            seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DeliveryHandler for Collector {
    async fn handle(&self, payload: &[u8]) -> bool {
        let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.echo {
            println!("{:>5}  {}", n, payload_preview(payload, PREVIEW_BYTES));
        }
        true
    }
}

/// Open and close one connection
pub async fn check(connector: &dyn QueueConnector) -> Result<()> {
    let connection = connector
        .connect(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
        .await
        .context("Broker connection failed")?;
    connection.stop().await;
    Ok(())
}

/// Publish `count` requests to `feed_queue`, then wait for `count` replies
///
/// Replies are acknowledged. Fewer replies than requests means the
/// inactivity `timeout` expired first.
pub async fn round_trip(
    connector: &dyn QueueConnector,
    feed_queue: &str,
    reply_queue: &str,
    count: usize,
    timeout: Duration,
) -> Result<RoundTripReport> {
    let start = Instant::now();

    info!(queue = feed_queue, count, "Sending requests");
    let feed = connector
        .connect(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
        .await
        .context("Broker connection failed")?;
    let sent = async {
        feed.start_consuming(&QueueSpec::new(feed_queue)).await?;
        for _ in 0..count {
            feed.publish(ROUND_TRIP_REQUEST.as_bytes(), None).await?;
        }
        Ok::<_, rabbitwhisk_core::port::QueueError>(())
    }
    .await;
    let dispatched = feed.outbound();
    feed.stop().await;
    sent.context("Publishing requests failed")?;
    info!(dispatched, "Dispatched messages");

    info!(queue = reply_queue, "Waiting for replies");
    let replies = connector
        .connect(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
        .await
        .context("Broker connection failed")?;
    let collector = Collector::new(false);
    let consumed = async {
        replies.start_consuming(&QueueSpec::new(reply_queue)).await?;
        replies.receive_loop(&collector, timeout, count).await
    }
    .await;
    let received = replies.inbound();
    replies.stop().await;
    consumed.context("Receiving replies failed")?;
    info!(received, "Received messages");

    Ok(RoundTripReport {
        dispatched,
        received,
        elapsed: start.elapsed(),
    })
}

/// Publish one persistent message
pub async fn publish(connector: &dyn QueueConnector, queue: &str, body: &[u8]) -> Result<()> {
    let connection = connector
        .connect(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
        .await
        .context("Broker connection failed")?;
    let result = connection.publish(body, Some(queue)).await;
    connection.stop().await;
    result.context("Publish failed")?;
    Ok(())
}

/// Consume and acknowledge up to `max` messages (0 = until idle)
pub async fn drain(
    connector: &dyn QueueConnector,
    queue: &str,
    max: usize,
    timeout: Duration,
    echo: bool,
) -> Result<usize> {
    let connection = connector
        .connect(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
        .await
        .context("Broker connection failed")?;
    let collector = Collector::new(echo);
    let drained = async {
        connection.start_consuming(&QueueSpec::new(queue)).await?;
        connection.receive_loop(&collector, timeout, max).await
    }
    .await;
    connection.stop().await;
    drained.context("Drain failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rabbitwhisk_core::port::message_queue::mocks::{
        ConnectFailure, InMemoryBroker, MockConnector,
    };

    const IDLE: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_check_reports_connection_failure() {
        let broker = InMemoryBroker::new();
        let connector = MockConnector::new(broker.clone());

        assert!(check(&connector).await.is_ok());
        assert_eq!(broker.open_connections(), 0);

        broker.fail_next_connect(ConnectFailure::Transient);
        assert!(check(&connector).await.is_err());
    }

    #[tokio::test]
    async fn test_round_trip_counts_replies() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker.push("replies", format!(r#"{{"reply":{i}}}"#));
        }
        let connector = MockConnector::new(broker.clone());

        let report = round_trip(&connector, "feed", "replies", 3, IDLE)
            .await
            .unwrap();

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.received, 3);
        assert_eq!(broker.depth("feed"), 3);
        assert_eq!(broker.depth("replies"), 0);
        assert_eq!(
            broker.messages("feed")[0],
            ROUND_TRIP_REQUEST.as_bytes().to_vec()
        );
    }

    #[tokio::test]
    async fn test_round_trip_missing_replies_time_out() {
        let broker = InMemoryBroker::new();
        broker.push("replies", "only one");
        let connector = MockConnector::new(broker.clone());

        let report = round_trip(&connector, "feed", "replies", 10, IDLE)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 10);
        assert_eq!(report.received, 1);
    }

    #[tokio::test]
    async fn test_publish_then_drain() {
        let broker = InMemoryBroker::new();
        let connector = MockConnector::new(broker.clone());

        publish(&connector, "jobs", b"one").await.unwrap();
        publish(&connector, "jobs", b"two").await.unwrap();
        assert_eq!(broker.depth("jobs"), 2);

        assert_eq!(drain(&connector, "jobs", 1, IDLE, false).await.unwrap(), 1);
        assert_eq!(broker.depth("jobs"), 1);
        assert_eq!(drain(&connector, "jobs", 0, IDLE, false).await.unwrap(), 1);
        assert_eq!(broker.depth("jobs"), 0);
        assert_eq!(broker.acked(), 2);
    }
}
