use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use bus_core::{BusError, EnvelopeHeader, MessageBusBase, Resolver, Serializer};

use crate::group_consumer::KafkaGroupConsumer;
use crate::producer::KafkaTransport;

/// Bounded grace period `dispose` waits for in-flight handlers to finish
/// before abandoning their poll-loop tasks.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The Kafka-backed message bus: a [`MessageBusBase`] plus the running group
/// consumers [`crate::builder::KafkaBusBuilder::build`] wired up for it. It
/// supplies the raw transport publish via [`KafkaTransport`] and owns the
/// consumer-group lifecycle the core doesn't know about.
pub struct KafkaMessageBus<S, R>
where
    S: Serializer + Clone + Send + Sync + 'static,
    R: Resolver + Send + Sync + 'static,
{
    bus: Arc<MessageBusBase<S, R, KafkaTransport>>,
    consumers: Vec<Arc<KafkaGroupConsumer>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, R> KafkaMessageBus<S, R>
where
    S: Serializer + Clone + Send + Sync + 'static,
    R: Resolver + Send + Sync + 'static,
{
    pub(crate) fn new(
        bus: Arc<MessageBusBase<S, R, KafkaTransport>>,
        consumers: Vec<Arc<KafkaGroupConsumer>>,
    ) -> Self {
        let handles = consumers.iter().cloned().map(KafkaGroupConsumer::spawn).collect();
        Self {
            bus,
            consumers,
            handles: Mutex::new(handles),
        }
    }

    /// Fire-and-forget publish. See [`MessageBusBase::publish`].
    pub async fn publish<M>(&self, message: &M, topic_override: Option<&str>) -> Result<(), BusError>
    where
        M: Serialize + 'static,
    {
        self.bus.publish(message, topic_override).await
    }

    /// Request/response send. See [`MessageBusBase::send`].
    pub async fn send<Req, Resp>(
        &self,
        request: &Req,
        timeout: Option<Duration>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<Resp, BusError>
    where
        Req: Serialize + 'static,
        Resp: DeserializeOwned + 'static,
    {
        self.bus.send(request, timeout, cancel).await
    }

    /// Reply to a request from within a handler. See [`MessageBusBase::reply`].
    pub async fn reply<Resp>(&self, original: &EnvelopeHeader, result: Result<&Resp, String>) -> Result<(), BusError>
    where
        Resp: Serialize,
    {
        self.bus.reply(original, result).await
    }

    pub fn resolver(&self) -> &Arc<R> {
        self.bus.resolver()
    }

    /// Teardown: stop every group consumer's poll loop, wait up to
    /// [`SHUTDOWN_GRACE_PERIOD`] for their in-flight handlers to drain, then
    /// dispose the base bus (closes the producer, fails any still-pending
    /// requests with `BusShutdown`). Calling this more than once is safe but
    /// only the first call does anything — later calls find no consumer
    /// handles left to wait on and delegate straight to the base bus.
    pub async fn dispose(&self) -> Result<(), BusError> {
        for consumer in &self.consumers {
            consumer.stop();
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, handle).await.is_err() {
                warn!("group consumer poll loop did not stop within the shutdown grace period");
            }
        }

        self.bus.dispose().await
    }
}
