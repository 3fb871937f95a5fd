use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::CorrelationId;
use crate::error::BusError;

/// Outcome delivered to a pending `Send` caller.
pub type PendingOutcome = Result<Vec<u8>, BusError>;

struct PendingRequest {
    deadline: Instant,
    sink: oneshot::Sender<PendingOutcome>,
}

const SHARD_COUNT: usize = 16;

fn shard_of(id: &CorrelationId) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// Concurrent map from correlation id to pending request, guarded by
/// sharded locks rather than one global mutex — this registry is the only
/// mutable shared state on the hot path.
///
/// A background sweeper (spawned by [`CorrelationRegistry::spawn_sweeper`])
/// periodically fails every entry whose deadline has elapsed.
pub struct CorrelationRegistry {
    shards: Vec<Mutex<HashMap<CorrelationId, PendingRequest>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        })
    }

    /// Register a fresh pending request with the given deadline. Returns a
    /// receiver the caller awaits for the outcome.
    pub async fn register(
        &self,
        id: CorrelationId,
        deadline: Instant,
    ) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        let shard = &self.shards[shard_of(&id)];
        shard.lock().await.insert(id, PendingRequest { deadline, sink: tx });
        rx
    }

    /// Resolve a pending request with a successful payload. Returns `true`
    /// iff the id was known (a late reply for an already-timed-out or
    /// already-resolved request is expected and simply dropped).
    pub async fn try_resolve(&self, id: &CorrelationId, payload: Vec<u8>) -> bool {
        self.complete(id, Ok(payload)).await
    }

    /// Fail a pending request (handler fault, cancellation, shutdown).
    pub async fn try_fail(&self, id: &CorrelationId, error: BusError) -> bool {
        self.complete(id, Err(error)).await
    }

    async fn complete(&self, id: &CorrelationId, outcome: PendingOutcome) -> bool {
        let shard = &self.shards[shard_of(id)];
        let mut guard = shard.lock().await;
        match guard.remove(id) {
            Some(pending) => {
                // The receiver may already be dropped (caller cancelled) —
                // that's not an error, there's simply nobody left to notify.
                let _ = pending.sink.send(outcome);
                true
            }
            None => {
                debug!("correlation id {} not found — late or already-settled reply", id);
                false
            }
        }
    }

    /// Remove and fail every entry whose deadline has elapsed as of `now`.
    pub async fn sweep_expired(&self, now: Instant) {
        for shard in &self.shards {
            let expired: Vec<(CorrelationId, PendingRequest)> = {
                let mut guard = shard.lock().await;
                let expired_ids: Vec<CorrelationId> = guard
                    .iter()
                    .filter(|(_, pending)| pending.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                expired_ids
                    .into_iter()
                    .filter_map(|id| guard.remove(&id).map(|p| (id, p)))
                    .collect()
            };
            for (id, pending) in expired {
                warn!("request {} timed out, removing from correlation registry", id);
                let _ = pending.sink.send(Err(BusError::RequestTimeout));
            }
        }
    }

    /// Remove an entry without resolving it (used when the caller cancels
    /// before a response/timeout arrives).
    pub async fn remove(&self, id: &CorrelationId) {
        let shard = &self.shards[shard_of(id)];
        shard.lock().await.remove(id);
    }

    /// Fail every still-pending entry (bus shutdown).
    pub async fn fail_all(&self, error_factory: impl Fn() -> BusError) {
        for shard in &self.shards {
            let mut guard = shard.lock().await;
            for (_, pending) in guard.drain() {
                let _ = pending.sink.send(Err(error_factory()));
            }
        }
    }

    /// Spawn the background sweep task, ticking every 250ms so expired
    /// requests are noticed well within a second of their deadline even
    /// under load. Returns a handle; abort it at bus dispose.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                registry.sweep_expired(Instant::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_payload() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register(id, Instant::now() + Duration::from_secs(30)).await;
        assert!(registry.try_resolve(&id, b"hello".to_vec()).await);
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn unknown_id_resolve_is_noop() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        assert!(!registry.try_resolve(&id, b"late".to_vec()).await);
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register(id, Instant::now() - Duration::from_millis(1)).await;
        registry.sweep_expired(Instant::now()).await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(BusError::RequestTimeout)));
    }

    #[tokio::test]
    async fn sweep_leaves_unexpired_entries_pending() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let rx = registry.register(id, Instant::now() + Duration::from_secs(60)).await;
        registry.sweep_expired(Instant::now()).await;
        assert!(registry.try_resolve(&id, b"ok".to_vec()).await);
        assert_eq!(rx.await.unwrap().unwrap(), b"ok".to_vec());
    }

    #[tokio::test]
    async fn remove_drops_entry_without_resolving() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let _rx = registry.register(id, Instant::now() + Duration::from_secs(30)).await;
        registry.remove(&id).await;
        assert!(!registry.try_resolve(&id, b"late".to_vec()).await);
    }

    #[tokio::test]
    async fn fail_all_rejects_every_pending_entry() {
        let registry = CorrelationRegistry::new();
        let id_a = CorrelationId::new();
        let id_b = CorrelationId::new();
        let rx_a = registry.register(id_a, Instant::now() + Duration::from_secs(30)).await;
        let rx_b = registry.register(id_b, Instant::now() + Duration::from_secs(30)).await;
        registry.fail_all(|| BusError::BusShutdown).await;
        assert!(matches!(rx_a.await.unwrap(), Err(BusError::BusShutdown)));
        assert!(matches!(rx_b.await.unwrap(), Err(BusError::BusShutdown)));
    }
}
