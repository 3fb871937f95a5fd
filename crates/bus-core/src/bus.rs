use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::capability::{Resolver, Serializer};
use crate::envelope::{CorrelationId, EnvelopeHeader};
use crate::error::BusError;
use crate::settings::BusSettings;
use crate::correlation::CorrelationRegistry;

/// One outbound record, transport-agnostic. `header` carries correlation
/// metadata for request/response traffic; fire-and-forget publishes leave
/// it `None`.
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    /// `None` defers to the broker/transport's own partitioner; `Some(p)`
    /// with `p < 0` is also treated as "defer".
    pub partition: Option<i32>,
    pub header: Option<EnvelopeHeader>,
    pub payload: Vec<u8>,
}

/// Raw transport publish, implemented by each concrete transport
/// (`bus-kafka`'s Kafka producer wrapper; Redis/in-memory transports are
/// out of scope here but would implement the same seam).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish_to_transport(&self, record: OutgoingRecord) -> Result<(), BusError>;

    /// Release transport-owned resources (e.g. flush + drop the producer).
    /// Called once, after all group consumers have stopped.
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Owns the serializer, resolver, and correlation registry; exposes
/// `publish`, `send`, `on_response_arrived`, and `reply`. Defers the raw
/// transport publish to the `T: Transport` implementation — this is the
/// message bus base that every concrete transport (Kafka, Redis, in-memory)
/// builds on top of.
pub struct MessageBusBase<S, R, T>
where
    S: Serializer,
    R: Resolver,
    T: Transport,
{
    serializer: S,
    resolver: Arc<R>,
    transport: T,
    settings: Arc<BusSettings>,
    correlation: Arc<CorrelationRegistry>,
    sweeper: JoinHandle<()>,
    disposed: AtomicBool,
}

impl<S, R, T> MessageBusBase<S, R, T>
where
    S: Serializer,
    R: Resolver,
    T: Transport,
{
    pub fn new(serializer: S, resolver: Arc<R>, transport: T, settings: Arc<BusSettings>) -> Self {
        let correlation = CorrelationRegistry::new();
        let sweeper = correlation.spawn_sweeper();
        Self {
            serializer,
            resolver,
            transport,
            settings,
            correlation,
            sweeper,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn resolver(&self) -> &Arc<R> {
        &self.resolver
    }

    pub fn settings(&self) -> &Arc<BusSettings> {
        &self.settings
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    pub fn correlation(&self) -> &Arc<CorrelationRegistry> {
        &self.correlation
    }

    /// Fire-and-forget publish. `topic_override` wins over the publisher
    /// registration's topic if both are present.
    pub async fn publish<M>(&self, message: &M, topic_override: Option<&str>) -> Result<(), BusError>
    where
        M: Serialize + 'static,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::BusShutdown);
        }

        let publisher = self.settings.publisher::<M>();
        let topic = topic_override
            .map(str::to_string)
            .or_else(|| self.settings.publisher_topic::<M>().map(str::to_string))
            .ok_or_else(|| {
                BusError::InvalidConfiguration(format!(
                    "no publisher registration or explicit topic for {}",
                    std::any::type_name::<M>()
                ))
            })?;

        let key = publisher.and_then(|p| key_selector(p, message));
        let partition = publisher.and_then(|p| partition_selector(p, message));

        let payload = self.serializer.serialize(message)?;

        self.transport
            .publish_to_transport(OutgoingRecord {
                topic,
                key,
                partition,
                header: None,
                payload,
            })
            .await
    }

    /// Send a request and await its correlated response. `timeout` wins
    /// over the request/response registration's default, which wins over
    /// the bus-wide default.
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
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::BusShutdown);
        }

        let rr = self
            .settings
            .request_response
            .as_ref()
            .ok_or_else(|| BusError::InvalidConfiguration("no request/response registration".into()))?;

        let publisher = self.settings.publisher::<Req>();
        let effective_timeout = timeout
            .or_else(|| publisher.and_then(|p| p.default_timeout()))
            .unwrap_or(rr.default_timeout);

        let topic = self
            .settings
            .publisher_topic::<Req>()
            .map(str::to_string)
            .ok_or_else(|| {
                BusError::InvalidConfiguration(format!(
                    "no publisher registration for request type {}",
                    std::any::type_name::<Req>()
                ))
            })?;

        let key = publisher.and_then(|p| key_selector(p, request));
        let partition = publisher.and_then(|p| partition_selector(p, request));

        let expires_at_ms = chrono::Utc::now().timestamp_millis()
            + effective_timeout.as_millis() as i64;
        let header = EnvelopeHeader::for_request(rr.reply_topic.clone(), expires_at_ms);
        let correlation_id = header.correlation_id;

        let deadline = Instant::now() + effective_timeout;
        let rx = self.correlation.register(correlation_id, deadline).await;

        let payload = self.serializer.serialize(request)?;

        if let Err(publish_err) = self
            .transport
            .publish_to_transport(OutgoingRecord {
                topic,
                key,
                partition,
                header: Some(header),
                payload,
            })
            .await
        {
            self.correlation.remove(&correlation_id).await;
            return Err(publish_err);
        }

        let outcome = match cancel {
            Some(cancel_rx) => {
                tokio::select! {
                    outcome = rx => outcome,
                    _ = cancel_rx => {
                        self.correlation.remove(&correlation_id).await;
                        return Err(BusError::RequestCancelled);
                    }
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(Ok(bytes)) => self.serializer.deserialize(&bytes),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BusError::BusShutdown),
        }
    }

    /// Called by the response processor when a reply arrives on the
    /// request/response reply topic. A response for an id not currently
    /// pending (already timed out, already resolved) is expected —
    /// it's logged and dropped, never surfaced as an error.
    pub async fn on_response_arrived(&self, header: EnvelopeHeader, payload: Vec<u8>) {
        let id = header.correlation_id;
        let known = if let Some(fault) = header.fault {
            self.correlation.try_fail(&id, BusError::HandlerFaulted(fault)).await
        } else {
            self.correlation.try_resolve(&id, payload).await
        };
        if !known {
            debug!("dropping response for unknown/expired correlation id {}", id);
        }
    }

    /// Called by the consumer pipeline when a request handler completes
    /// (successfully or with a fault), to publish the reply envelope back
    /// to the original sender's `reply_to` topic.
    pub async fn reply<Resp>(
        &self,
        original: &EnvelopeHeader,
        result: Result<&Resp, String>,
    ) -> Result<(), BusError>
    where
        Resp: Serialize,
    {
        let reply_to = original
            .reply_to
            .clone()
            .ok_or_else(|| BusError::InvalidConfiguration("request envelope missing reply_to".into()))?;

        let (fault, payload) = match result {
            Ok(response) => (None, self.serializer.serialize(response)?),
            Err(message) => (Some(message), Vec::new()),
        };

        let header = EnvelopeHeader::for_response(original.correlation_id, fault);

        self.transport
            .publish_to_transport(OutgoingRecord {
                topic: reply_to,
                key: None,
                partition: None,
                header: Some(header),
                payload,
            })
            .await
    }

    /// Idempotent teardown: abort the sweeper, close the transport, then
    /// fail every still-pending request with `BusShutdown`. Stopping group
    /// consumers and draining in-flight handlers is the transport-specific
    /// wrapper's responsibility and must happen *before* calling this.
    pub async fn dispose(&self) -> Result<(), BusError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sweeper.abort();
        let close_result = self.transport.close().await;
        self.correlation.fail_all(|| BusError::BusShutdown).await;
        if let Err(err) = &close_result {
            warn!("error closing transport during bus dispose: {}", err);
        }
        close_result
    }
}

impl<S, R, T> Drop for MessageBusBase<S, R, T>
where
    S: Serializer,
    R: Resolver,
    T: Transport,
{
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn key_selector<T: 'static>(spec: &crate::settings::PublisherSpec<T>, message: &T) -> Option<Vec<u8>> {
    spec.key_selector_fn().and_then(|f| f(message))
}

fn partition_selector<T: 'static>(spec: &crate::settings::PublisherSpec<T>, message: &T) -> Option<i32> {
    spec.partition_selector_fn().map(|f| f(message)).and_then(|p| if p < 0 { None } else { Some(p) })
}
