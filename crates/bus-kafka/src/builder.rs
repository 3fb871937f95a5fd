use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use bus_core::{BusError, BusSettings, MessageBusBase, Resolver, Serializer};

use crate::bus::KafkaMessageBus;
use crate::config::KafkaSettings;
use crate::group_consumer::KafkaGroupConsumer;
use crate::processor::{DispatchFn, DispatchFuture, KafkaMessage};
use crate::producer::KafkaTransport;

/// Implemented by a fire-and-forget consumer's concrete handler type.
/// Resolved once per dispatch via the bus's `Resolver`, matching
/// `kafka-service/src/processor.rs`'s `MessageProcessor` shape generalized
/// over an arbitrary message type instead of one fixed `WebhookEvent`.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    async fn handle(&self, message: M) -> Result<(), BusError>;
}

/// Implemented by a request/response consumer's concrete handler type. A
/// `Result::Err` here becomes a fault envelope on the reply topic rather
/// than a dropped message.
#[async_trait]
pub trait RequestHandler<Req, Resp>: Send + Sync
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    async fn handle(&self, request: Req) -> Result<Resp, String>;
}

type DispatchFactory<S, R> =
    Box<dyn FnOnce(Arc<MessageBusBase<S, R, KafkaTransport>>) -> DispatchFn + Send>;

/// Wires a validated [`BusSettings`] onto running Kafka group consumers and
/// a Kafka producer. Handler dispatch closures are bound here, generically,
/// rather than stored type-erased in `bus-core` — `BusSettings` only
/// carries the metadata needed to validate and to size each processor.
pub struct KafkaBusBuilder<S, R>
where
    S: Serializer + Clone + Send + Sync + 'static,
    R: Resolver + Send + Sync + 'static,
{
    kafka: KafkaSettings,
    settings: Arc<BusSettings>,
    serializer: S,
    resolver: Arc<R>,
    dispatch_factories: HashMap<(String, String), DispatchFactory<S, R>>,
}

impl<S, R> KafkaBusBuilder<S, R>
where
    S: Serializer + Clone + Send + Sync + 'static,
    R: Resolver + Send + Sync + 'static,
{
    pub fn new(kafka: KafkaSettings, settings: Arc<BusSettings>, serializer: S, resolver: Arc<R>) -> Self {
        Self {
            kafka,
            settings,
            serializer,
            resolver,
            dispatch_factories: HashMap::new(),
        }
    }

    /// Bind the handler for a `SubscribeTo<M>` registration on `(group,
    /// topic)`. Keyed by group as well as topic because distinct consumer
    /// groups are allowed to independently consume the same topic —
    /// uniqueness is per `(topic, group, messageType)`, not per topic.
    pub fn with_subscriber<M, H>(mut self, group: impl Into<String>, topic: impl Into<String>, handler: Arc<H>) -> Self
    where
        M: DeserializeOwned + Send + Sync + 'static,
        H: MessageHandler<M> + 'static,
    {
        let serializer = self.serializer.clone();
        self.dispatch_factories.insert(
            (group.into(), topic.into()),
            Box::new(move |_bus| {
                let handler = handler.clone();
                let serializer = serializer.clone();
                build_subscriber_dispatch(handler, serializer)
            }),
        );
        self
    }

    /// Bind the handler for a `Handle<Req, Resp>` registration on `(group,
    /// topic)`. Unlike `with_subscriber`, the dispatch closure also needs the
    /// bus itself (to call `reply`), so it's finalized in [`Self::build`]
    /// once the bus exists.
    pub fn with_request_handler<Req, Resp, H>(
        mut self,
        group: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<H>,
    ) -> Self
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        H: RequestHandler<Req, Resp> + 'static,
    {
        self.dispatch_factories.insert(
            (group.into(), topic.into()),
            Box::new(move |bus| build_request_handler_dispatch(handler, bus)),
        );
        self
    }

    /// Finalize: create the producer, the bus base, and one running group
    /// consumer per `(topic, group)` registration plus the reply-topic
    /// consumer for `ExpectRequestResponses`, if any.
    pub async fn build(mut self) -> Result<KafkaMessageBus<S, R>, BusError> {
        let transport = KafkaTransport::new(&self.kafka)?;
        let bus = Arc::new(MessageBusBase::new(
            self.serializer.clone(),
            self.resolver.clone(),
            transport,
            self.settings.clone(),
        ));

        let mut consumers = Vec::with_capacity(self.settings.consumers.len() + 1);

        for registration in &self.settings.consumers {
            let key = (registration.group.clone(), registration.topic.clone());
            let factory = self.dispatch_factories.remove(&key).ok_or_else(|| {
                BusError::InvalidConfiguration(format!(
                    "no handler registered for group '{}' on topic '{}' (message type {})",
                    registration.group, registration.topic, registration.message_type
                ))
            })?;
            let dispatch = factory(bus.clone());

            let consumer = KafkaGroupConsumer::new(
                &self.kafka,
                &registration.group,
                &registration.topic,
                dispatch,
                registration.instances,
                registration.checkpoint.count,
                registration.checkpoint.duration,
            )?;
            consumers.push(Arc::new(consumer));
        }

        if let Some(rr) = &self.settings.request_response {
            let bus_for_responses = bus.clone();
            let dispatch: DispatchFn = Arc::new(move |message: KafkaMessage| {
                let bus = bus_for_responses.clone();
                Box::pin(async move {
                    let header = message.header.ok_or_else(|| {
                        BusError::InvalidConfiguration("response message missing envelope header".to_string())
                    })?;
                    bus.on_response_arrived(header, message.payload).await;
                    Ok(())
                }) as DispatchFuture
            });

            let consumer = KafkaGroupConsumer::new(
                &self.kafka,
                &rr.group,
                &rr.reply_topic,
                dispatch,
                1,
                bus_core::CheckpointTrigger::DEFAULT_COUNT,
                bus_core::CheckpointTrigger::DEFAULT_DURATION,
            )?;
            consumers.push(Arc::new(consumer));
        }

        Ok(KafkaMessageBus::new(bus, consumers))
    }
}

fn build_subscriber_dispatch<M, H, S>(handler: Arc<H>, serializer: S) -> DispatchFn
where
    M: DeserializeOwned + Send + Sync + 'static,
    H: MessageHandler<M> + 'static,
    S: Serializer + Send + Sync + 'static,
{
    Arc::new(move |message: KafkaMessage| {
        let handler = handler.clone();
        let value: Result<M, BusError> = serializer.deserialize(&message.payload);
        Box::pin(async move { handler.handle(value?).await }) as BoxFuture<'static, Result<(), BusError>>
    })
}

fn build_request_handler_dispatch<Req, Resp, H, S, R>(
    handler: Arc<H>,
    bus: Arc<MessageBusBase<S, R, KafkaTransport>>,
) -> DispatchFn
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
    H: RequestHandler<Req, Resp> + 'static,
    S: Serializer + Send + Sync + 'static,
    R: Resolver + Send + Sync + 'static,
{
    Arc::new(move |message: KafkaMessage| {
        let handler = handler.clone();
        let bus = bus.clone();
        Box::pin(async move {
            let header = message.header.ok_or_else(|| {
                BusError::InvalidConfiguration("request message missing envelope header".to_string())
            })?;
            let request: Req = bus.serializer().deserialize(&message.payload)?;
            match handler.handle(request).await {
                Ok(response) => bus.reply(&header, Ok::<_, String>(&response)).await,
                Err(fault) => bus.reply::<Resp>(&header, Err(fault)).await,
            }
        }) as DispatchFuture
    })
}
