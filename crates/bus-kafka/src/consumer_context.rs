use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::TopicPartitionList;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Rebalance-aware consumer context. Completes the `MessageConsumerContext`
/// stub sketched in `kafka-service/src/consumer.rs`: tracks which partitions
/// are currently owned so the dispatch loop can stop handing out *new* work
/// for a partition the instant it's revoked, the same "skip messages from
/// revoked partitions" guard the PostHog `kafka-deduplicator` consumer uses
/// (`tracker.is_partition_active`) rather than attempting to forcibly abort
/// handlers already in flight. Revoked partition numbers are also pushed
/// onto `revoked_tx` so the owning `KafkaGroupConsumer`'s poll loop can call
/// `PartitionProcessor::on_partition_revoked` on each — rdkafka invokes this
/// callback from its own poll thread, so it cannot call back into the async
/// processor directly. `on_partition_revoked` bumps that partition's
/// `CommitController` generation, so handlers still in flight at revocation
/// time can finish in the background without risk of corrupting whatever
/// assignment later reuses the same partition number — see `commit.rs`.
pub struct KafkaConsumerContext {
    label: String,
    active_partitions: Arc<Mutex<HashSet<i32>>>,
    revoked_tx: mpsc::UnboundedSender<i32>,
}

impl KafkaConsumerContext {
    pub fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<i32>) {
        let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
        (
            Self {
                label: label.into(),
                active_partitions: Arc::new(Mutex::new(HashSet::new())),
                revoked_tx,
            },
            revoked_rx,
        )
    }

    pub fn is_partition_active(&self, partition: i32) -> bool {
        self.active_partitions.lock().unwrap().contains(&partition)
    }
}

impl ClientContext for KafkaConsumerContext {}

impl ConsumerContext for KafkaConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let mut active = self.active_partitions.lock().unwrap();
            for elem in tpl.elements() {
                let partition = elem.partition();
                active.remove(&partition);
                let _ = self.revoked_tx.send(partition);
            }
            info!(consumer = %self.label, "revoking {} partition(s)", tpl.elements().len());
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let mut active = self.active_partitions.lock().unwrap();
                for elem in tpl.elements() {
                    active.insert(elem.partition());
                }
                info!(consumer = %self.label, "assigned {} partition(s)", tpl.elements().len());
            }
            Rebalance::Error(err) => {
                warn!(consumer = %self.label, "rebalance error: {}", err);
            }
            Rebalance::Revoke(_) => {}
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(err) = result {
            warn!(consumer = %self.label, "offset commit failed: {}", err);
        }
    }
}
