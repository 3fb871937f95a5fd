use std::sync::Arc;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use bus_core::BusError;

use crate::config::KafkaSettings;
use crate::consumer_context::KafkaConsumerContext;
use crate::processor::{DispatchFn, KafkaMessage, PartitionProcessor};
use crate::producer::{decode_envelope, ENVELOPE_HEADER_KEY};

/// Owns one Kafka consumer-group membership and its poll loop. Mirrors
/// `kafka-service/src/consumer.rs`'s `consume_batch` loop
/// shape (manual `recv()` + timeout) generalized to push each message
/// through a [`PartitionProcessor`] instead of buffering a batch.
pub struct KafkaGroupConsumer {
    consumer: Arc<StreamConsumer<KafkaConsumerContext>>,
    processor: Arc<PartitionProcessor>,
    topic: String,
    poll_timeout: std::time::Duration,
    shutdown: watch::Sender<bool>,
    revoked_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<i32>>>,
}

impl KafkaGroupConsumer {
    /// Create the consumer-group membership for a `(topic, group)`
    /// registration and the [`PartitionProcessor`] that drives it, sharing
    /// one `StreamConsumer` between polling and commits.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kafka: &KafkaSettings,
        group: &str,
        topic: &str,
        dispatch: DispatchFn,
        instances: u32,
        checkpoint_count: u32,
        checkpoint_duration: std::time::Duration,
    ) -> Result<Self, BusError> {
        let (context, revoked_rx) = KafkaConsumerContext::new(format!("{group}/{topic}"));

        let consumer: StreamConsumer<KafkaConsumerContext> = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("client.id", &kafka.client_id)
            .set("group.id", group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", kafka.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", kafka.max_poll_interval_ms.to_string())
            .create_with_context(context)
            .map_err(|e| BusError::InvalidConfiguration(format!("failed to create Kafka consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| BusError::InvalidConfiguration(format!("failed to subscribe to topic {topic}: {e}")))?;

        let consumer = Arc::new(consumer);
        let processor = PartitionProcessor::new(
            consumer.clone(),
            topic,
            dispatch,
            instances,
            checkpoint_count,
            checkpoint_duration,
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            consumer,
            processor,
            topic: topic.to_string(),
            poll_timeout: kafka.poll_timeout,
            shutdown,
            revoked_rx: std::sync::Mutex::new(Some(revoked_rx)),
        })
    }

    /// Run the poll loop until `stop()` is called. Each received message is
    /// handed to the processor, which bounds its concurrency and tracks
    /// completion for commit purposes; a poll error is logged and retried
    /// after a short backoff rather than tearing down the consumer.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut revoked_rx = self
            .revoked_rx
            .lock()
            .unwrap()
            .take()
            .expect("KafkaGroupConsumer::spawn must only be called once");
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    // A rebalance revoked this partition on the driver's
                    // internal thread; reset its checkpoint/commit state so
                    // the next owner observes a clean at-least-once restart.
                    Some(partition) = revoked_rx.recv() => {
                        self.processor.on_partition_revoked(partition).await;
                    }
                    result = tokio::time::timeout(self.poll_timeout, self.consumer.recv()) => {
                        match result {
                            Ok(Ok(message)) => {
                                let partition = message.partition();
                                if !self.consumer.context().is_partition_active(partition) {
                                    debug!(topic = %self.topic, partition, "dropping message for revoked partition");
                                    continue;
                                }

                                let header = message
                                    .headers()
                                    .and_then(|headers| {
                                        headers.iter().find(|h| h.key == ENVELOPE_HEADER_KEY)
                                    })
                                    .and_then(|h| h.value.map(|bytes| bytes.to_vec()))
                                    .and_then(|bytes| match decode_envelope(&bytes) {
                                        Ok(header) => Some(header),
                                        Err(err) => {
                                            warn!("failed to decode envelope header: {}", err);
                                            None
                                        }
                                    });

                                let kafka_message = KafkaMessage {
                                    partition,
                                    offset: message.offset(),
                                    key: message.key().map(|k| k.to_vec()),
                                    payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
                                    header,
                                };
                                drop(message);
                                self.processor.on_message(kafka_message).await;
                            }
                            Ok(Err(KafkaError::PartitionEOF(partition))) => {
                                self.processor.on_partition_end_reached(partition).await;
                            }
                            Ok(Err(err)) => {
                                error!(topic = %self.topic, "error receiving message: {}", err);
                                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                            }
                            Err(_) => {
                                debug!(topic = %self.topic, "poll timeout, continuing");
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
