use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use bus_core::{BusError, CheckpointTrigger, EnvelopeHeader};

use crate::commit::CommitController;
use crate::consumer_context::KafkaConsumerContext;

pub type DispatchFuture = BoxFuture<'static, Result<(), BusError>>;

/// Type-erased per-message handler: built generically in
/// [`crate::builder`] (monomorphized over the registration's concrete
/// message/response types) and stored here behind a closure so one
/// processor type can drive every registration regardless of its payload
/// types.
pub type DispatchFn = Arc<dyn Fn(KafkaMessage) -> DispatchFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct KafkaMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub header: Option<EnvelopeHeader>,
}

/// One running registration's processing pipeline for a single `(topic,
/// group)` pair: bounded per-partition concurrency, and completion-ordered
/// commit gated by a per-partition `CheckpointTrigger`.
pub struct PartitionProcessor {
    consumer: Arc<StreamConsumer<KafkaConsumerContext>>,
    topic: String,
    dispatch: DispatchFn,
    permits_per_partition: u32,
    semaphores: Mutex<HashMap<i32, Arc<Semaphore>>>,
    commits: Mutex<CommitController>,
    checkpoints: Mutex<HashMap<i32, CheckpointTrigger>>,
    checkpoint_count: u32,
    checkpoint_duration: Duration,
}

impl PartitionProcessor {
    pub fn new(
        consumer: Arc<StreamConsumer<KafkaConsumerContext>>,
        topic: impl Into<String>,
        dispatch: DispatchFn,
        instances: u32,
        checkpoint_count: u32,
        checkpoint_duration: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            topic: topic.into(),
            dispatch,
            permits_per_partition: instances.max(1),
            semaphores: Mutex::new(HashMap::new()),
            commits: Mutex::new(CommitController::new()),
            checkpoints: Mutex::new(HashMap::new()),
            checkpoint_count,
            checkpoint_duration,
        })
    }

    async fn semaphore_for(&self, partition: i32) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .await
            .entry(partition)
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_partition as usize)))
            .clone()
    }

    /// Track the message as in-flight and spawn its dispatch, bounded by
    /// the partition's semaphore. Returns immediately; completion (and any
    /// resulting commit) happens on the spawned task. The partition's
    /// current assignment generation (see [`CommitController`]) travels
    /// with the spawned task so its eventual completion can be recognized
    /// as stale if the partition is revoked and reassigned before it
    /// finishes — tracking and generation capture happen under the same
    /// `commits` lock so there's no window for a revocation to land between
    /// them.
    pub async fn on_message(self: &Arc<Self>, message: KafkaMessage) {
        let partition = message.partition;
        let offset = message.offset;

        let generation = self.commits.lock().await.track(partition, offset);

        let semaphore = self.semaphore_for(partition).await;
        let permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let this = self.clone();
        let dispatch = self.dispatch.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = dispatch(message).await {
                warn!(topic = %this.topic, partition, offset, "handler failed: {}", err);
            }
            this.complete(partition, offset, generation).await;
        });
    }

    /// Revocation drops commit/checkpoint bookkeeping for the partition and
    /// bumps its [`CommitController`] generation counter. In-flight handlers
    /// that were already spawned under the old generation run to
    /// completion, but `complete` recognizes their generation no longer
    /// matches and drops their result instead of feeding it into the
    /// (possibly already reassigned) partition's commit frontier — this is
    /// what makes it safe to let in-flight work finish in the background
    /// rather than blocking the rebalance callback on a drain.
    pub async fn on_partition_revoked(&self, partition: i32) {
        self.commits.lock().await.forget_partition(partition);
        self.checkpoints.lock().await.remove(&partition);
        self.semaphores.lock().await.remove(&partition);
    }

    /// The consumer has caught up with the broker's high-water mark for
    /// `partition`: commit the given offset, flushing rather than idling.
    /// Commit the highest frontier already known rather than waiting for
    /// the checkpoint trigger to fire, and reset the trigger so it starts a
    /// fresh window once new records arrive.
    pub async fn on_partition_end_reached(&self, partition: i32) {
        let commit_offset = self.commits.lock().await.last_commit_offset(partition);
        let Some(commit_offset) = commit_offset else {
            return;
        };
        self.checkpoints.lock().await.entry(partition).or_insert_with(|| {
            CheckpointTrigger::new(self.checkpoint_count, self.checkpoint_duration)
        }).reset();
        self.commit(partition, commit_offset);
    }

    async fn complete(&self, partition: i32, offset: i64, generation: u64) {
        // `None` covers two unremarkable cases: an earlier offset on this
        // partition is still outstanding (ordinary out-of-order completion
        // under concurrent dispatch), or the partition was revoked and
        // reassigned since this offset was tracked, so `generation` is
        // stale — either way there's nothing to commit yet.
        let commit_offset = self.commits.lock().await.complete(partition, offset, generation);
        let Some(commit_offset) = commit_offset else {
            return;
        };

        let fires = {
            let mut checkpoints = self.checkpoints.lock().await;
            let trigger = checkpoints
                .entry(partition)
                .or_insert_with(|| CheckpointTrigger::new(self.checkpoint_count, self.checkpoint_duration));
            trigger.increment()
        };

        if fires {
            self.commit(partition, commit_offset);
        }
    }

    fn commit(&self, partition: i32, offset: i64) {
        let mut tpl = TopicPartitionList::new();
        if let Err(err) = tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset)) {
            warn!(topic = %self.topic, partition, "failed to build commit offsets: {}", err);
            return;
        }
        match self.consumer.commit(&tpl, CommitMode::Async) {
            Ok(()) => debug!(topic = %self.topic, partition, offset, "checkpoint committed"),
            Err(err) => warn!(topic = %self.topic, partition, offset, "commit failed: {}", err),
        }
    }
}
