// AMQP queue connection (lapin)
// One connection + one channel, bounded prefetch, manual acknowledgement
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::message::Delivery;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rabbitwhisk_core::application::worker::constants::PREFETCH_COUNT;
use rabbitwhisk_core::application::{shutdown_channel, ShutdownSender, ShutdownToken};
use rabbitwhisk_core::domain::{InFlightMessage, QueueSpec};
use rabbitwhisk_core::port::{DeliveryHandler, QueueConnection, QueueError};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CLOSE_REPLY_CODE: u16 = 200;

fn broker_error(e: lapin::Error) -> QueueError {
    QueueError::Broker(e.to_string())
}

/// An ended consumer stream means the broker cancelled the subscription
fn next_delivery(next: Option<Result<Delivery, lapin::Error>>) -> Result<Delivery, QueueError> {
    match next {
        Some(Ok(delivery)) => Ok(delivery),
        Some(Err(e)) => Err(broker_error(e)),
        None => Err(QueueError::Broker("consumer cancelled by broker".to_string())),
    }
}

/// Live broker session
pub struct AmqpQueueConnection {
    connection: Connection,
    channel: Channel,
    queue: Mutex<Option<QueueSpec>>,
    consumer_tag: Mutex<Option<String>>,
    inbound: AtomicU64,
    outbound: AtomicU64,
    stop_tx: ShutdownSender,
    stop_rx: ShutdownToken,
    closed: AtomicBool,
}

impl AmqpQueueConnection {
    pub(crate) fn new(connection: Connection, channel: Channel) -> Self {
        let (stop_tx, stop_rx) = shutdown_channel();
        Self {
            connection,
            channel,
            queue: Mutex::new(None),
            consumer_tag: Mutex::new(None),
            inbound: AtomicU64::new(0),
            outbound: AtomicU64::new(0),
            stop_tx,
            stop_rx,
            closed: AtomicBool::new(false),
        }
    }

    async fn cancel_consumer(&self) {
        let tag = self.consumer_tag.lock().await.take();
        if let Some(tag) = tag {
            if let Err(e) = self
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                debug!(consumer = %tag, error = %e, "Consumer cancel failed");
            }
        }
    }
}

#[async_trait]
impl QueueConnection for AmqpQueueConnection {
    async fn start_consuming(&self, queue: &QueueSpec) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;

        self.channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(broker_error)?;

        if queue.purge {
            let purged = self
                .channel
                .queue_purge(&queue.name, QueuePurgeOptions::default())
                .await
                .map_err(broker_error)?;
            info!(queue = %queue.name, purged, "Queue purged");
        }

        *self.queue.lock().await = Some(queue.clone());
        Ok(())
    }

    async fn receive_loop(
        &self,
        handler: &dyn DeliveryHandler,
        inactivity_timeout: Duration,
        max_messages: usize,
    ) -> Result<usize, QueueError> {
        let queue = self
            .queue
            .lock()
            .await
            .clone()
            .ok_or(QueueError::NotConsuming)?;

        let tag = format!("rabbitwhisk-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &queue.name,
                &tag,
                BasicConsumeOptions {
                    exclusive: queue.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error)?;
        *self.consumer_tag.lock().await = Some(tag.clone());
        debug!(queue = %queue.name, consumer = %tag, "Consumer started");

        let mut stop = self.stop_rx.clone();
        let mut received = 0usize;

        let result = loop {
            if stop.is_shutdown() {
                break Ok(received);
            }

            let next = tokio::select! {
                _ = stop.wait() => break Ok(received),
                next = timeout(inactivity_timeout, consumer.next()) => next,
            };

            let delivery = match next.map(next_delivery) {
                Err(_) => {
                    debug!(queue = %queue.name, "No delivery before inactivity timeout");
                    break Ok(received);
                }
                Ok(Err(e)) => {
                    warn!(queue = %queue.name, error = %e, "Consumer ended");
                    break Err(e);
                }
                Ok(Ok(delivery)) => delivery,
            };

            let message = InFlightMessage {
                delivery_tag: delivery.delivery_tag,
                payload: delivery.data,
            };
            received += 1;
            self.inbound.fetch_add(1, Ordering::SeqCst);

            if handler.handle(&message.payload).await {
                if let Err(e) = self
                    .channel
                    .basic_ack(message.delivery_tag, BasicAckOptions::default())
                    .await
                {
                    break Err(broker_error(e));
                }
            }

            if max_messages > 0 && received >= max_messages {
                break Ok(received);
            }
        };

        self.cancel_consumer().await;
        result
    }

    async fn publish(&self, payload: &[u8], queue: Option<&str>) -> Result<(), QueueError> {
        let routing_key = match queue {
            Some(name) => name.to_string(),
            None => self
                .queue
                .lock()
                .await
                .as_ref()
                .map(|q| q.name.clone())
                .ok_or(QueueError::NotConsuming)?,
        };

        let confirm = self
            .channel
            .basic_publish(
                "",
                &routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(broker_error)?;
        confirm.await.map_err(broker_error)?;

        self.outbound.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.shutdown();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel_consumer().await;
        if let Err(e) = self.channel.close(CLOSE_REPLY_CODE, "Bye").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(CLOSE_REPLY_CODE, "Bye").await {
            warn!(error = %e, "Connection close failed");
        }
        debug!(
            inbound = self.inbound(),
            outbound = self.outbound(),
            "Broker connection closed"
        );
    }

    fn inbound(&self) -> u64 {
        self.inbound.load(Ordering::SeqCst)
    }

    fn outbound(&self) -> u64 {
        self.outbound.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_consumer_is_recoverable_error() {
        let err = next_delivery(None).err().unwrap();
        assert_eq!(
            err,
            QueueError::Broker("consumer cancelled by broker".to_string())
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_stream_error_maps_to_broker_error() {
        let err = next_delivery(Some(Err(lapin::Error::ChannelsLimitReached))).err().unwrap();
        assert!(matches!(err, QueueError::Broker(_)));
    }
}
