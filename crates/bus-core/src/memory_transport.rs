use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::{OutgoingRecord, Transport};
use crate::error::BusError;

/// Minimal in-process transport used to exercise the bus base's
/// publish/send/reply contract without a live Kafka cluster. Not a shipped
/// transport — a production in-memory transport and a Redis transport are
/// out of scope for this crate.
///
/// Every published record is delivered synchronously to any subscriber
/// registered for its topic via [`MemoryTransport::subscribe`].
#[derive(Clone, Default)]
pub struct MemoryTransport {
    subscribers: Arc<Mutex<HashMap<String, Vec<Arc<dyn Fn(OutgoingRecord) + Send + Sync>>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(OutgoingRecord) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .await
            .entry(topic.into())
            .or_default()
            .push(Arc::new(handler));
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn publish_to_transport(&self, record: OutgoingRecord) -> Result<(), BusError> {
        let subscribers = self.subscribers.lock().await;
        if let Some(handlers) = subscribers.get(&record.topic) {
            for handler in handlers {
                handler(OutgoingRecord {
                    topic: record.topic.clone(),
                    key: record.key.clone(),
                    partition: record.partition,
                    header: record.header.clone(),
                    payload: record.payload.clone(),
                });
            }
        }
        Ok(())
    }
}
