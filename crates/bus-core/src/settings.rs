use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BusError;

/// Opaque identity for a message type, carried instead of runtime
/// reflection. Two `TypeTag`s are equal iff they were derived from the same
/// Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

type KeySelectorFn<T> = Arc<dyn Fn(&T) -> Option<Vec<u8>> + Send + Sync>;
type PartitionSelectorFn<T> = Arc<dyn Fn(&T) -> i32 + Send + Sync>;

/// Fluent, per-type spec for a `Publish<T>` registration.
pub struct PublisherSpec<T> {
    topic: String,
    key_selector: Option<KeySelectorFn<T>>,
    partition_selector: Option<PartitionSelectorFn<T>>,
    default_timeout: Option<Duration>,
}

impl<T> PublisherSpec<T> {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key_selector: None,
            partition_selector: None,
            default_timeout: None,
        }
    }

    /// Per-type default `Send` timeout (`DefaultTimeout`). Only meaningful
    /// when `T` is also used as a request type; ignored for fire-and-forget
    /// publishes.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Compute record key bytes from the message. Absent means no key.
    pub fn with_key_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&T) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.key_selector = Some(Arc::new(selector));
        self
    }

    /// Compute a non-negative partition index. Returning `-1` (or simply
    /// never registering a selector) defers to the broker partitioner.
    pub fn with_partition_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&T) -> i32 + Send + Sync + 'static,
    {
        self.partition_selector = Some(Arc::new(selector));
        self
    }

    pub(crate) fn key_selector_fn(&self) -> Option<&KeySelectorFn<T>> {
        self.key_selector.as_ref()
    }

    pub(crate) fn partition_selector_fn(&self) -> Option<&PartitionSelectorFn<T>> {
        self.partition_selector.as_ref()
    }
}

/// Type-erased wrapper so publisher specs of differing `T` can live in the
/// same registry, keyed by `TypeTag`.
pub(crate) struct ErasedPublisherRegistration {
    pub topic: String,
    inner: Box<dyn Any + Send + Sync>,
}

impl ErasedPublisherRegistration {
    fn new<T: 'static>(spec: PublisherSpec<T>) -> Self {
        Self {
            topic: spec.topic.clone(),
            inner: Box::new(spec),
        }
    }

    pub(crate) fn downcast<T: 'static>(&self) -> &PublisherSpec<T> {
        self.inner
            .downcast_ref::<PublisherSpec<T>>()
            .expect("publisher registration type mismatch — registry corrupted")
    }
}

/// What kind of interaction a consumer registration implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Fire-and-forget: the handler is invoked, nothing is published back.
    Subscriber,
    /// Request/response: the handler's return value (or fault) is published
    /// back to the envelope's `reply_to` topic.
    RequestHandler,
}

/// Per-consumer checkpoint tuning — maps to the `CheckpointCount` /
/// `CheckpointDuration` configuration options.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointSpec {
    pub count: u32,
    pub duration: Duration,
}

impl Default for CheckpointSpec {
    fn default() -> Self {
        Self {
            count: crate::checkpoint::CheckpointTrigger::DEFAULT_COUNT,
            duration: crate::checkpoint::CheckpointTrigger::DEFAULT_DURATION,
        }
    }
}

/// Metadata describing one consumer registration. Handler dispatch itself
/// (obtaining an instance from the Resolver and invoking it) is the
/// transport layer's responsibility (`bus-kafka`'s builder binds concrete,
/// monomorphized closures alongside this metadata) — this struct carries
/// only what `build()` needs to validate and what the transport needs to
/// create a processor.
#[derive(Debug, Clone)]
pub struct ConsumerRegistration {
    pub message_type: TypeTag,
    pub response_type: Option<TypeTag>,
    pub topic: String,
    pub group: String,
    pub kind: HandlerKind,
    pub handler_type_name: &'static str,
    pub instances: u32,
    pub checkpoint: CheckpointSpec,
    pub properties: HashMap<String, String>,
}

/// `ExpectRequestResponses` registration: at most one per bus.
#[derive(Debug, Clone)]
pub struct RequestResponseRegistration {
    pub reply_topic: String,
    pub group: String,
    pub default_timeout: Duration,
}

pub struct RequestResponseSpec {
    reply_topic: String,
    group: String,
    default_timeout: Duration,
}

impl RequestResponseSpec {
    pub fn new(reply_topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            reply_topic: reply_topic.into(),
            group: group.into(),
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Fluent spec for a `SubscribeTo<T>` or `Handle<Req, Resp>` registration.
pub struct ConsumerSpec {
    topic: String,
    group: String,
    instances: u32,
    checkpoint: CheckpointSpec,
    properties: HashMap<String, String>,
}

impl ConsumerSpec {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            instances: 1,
            checkpoint: CheckpointSpec::default(),
            properties: HashMap::new(),
        }
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_checkpoint(mut self, count: u32, duration: Duration) -> Self {
        self.checkpoint = CheckpointSpec { count, duration };
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Immutable, validated bus configuration. Produced once by
/// `BusSettingsBuilder::build()` and never mutated afterward — routing
/// tables are looked up on every `Publish`/`Send`/dispatch but never
/// inserted into past this point.
pub struct BusSettings {
    pub(crate) publishers: HashMap<TypeId, ErasedPublisherRegistration>,
    pub consumers: Vec<ConsumerRegistration>,
    pub request_response: Option<RequestResponseRegistration>,
}

impl BusSettings {
    pub(crate) fn publisher<T: 'static>(&self) -> Option<&PublisherSpec<T>> {
        self.publishers
            .get(&TypeId::of::<T>())
            .map(|erased| erased.downcast::<T>())
    }

    pub(crate) fn publisher_topic<T: 'static>(&self) -> Option<&str> {
        self.publishers
            .get(&TypeId::of::<T>())
            .map(|erased| erased.topic.as_str())
    }
}

/// Builds and validates a [`BusSettings`]. Mirrors the fluent
/// registration style used by `armature-messaging`'s `PublishOptions`/
/// `SubscribeOptions` and by this workspace's own `KafkaSettings` builder,
/// rather than a reflection-driven DSL.
#[derive(Default)]
pub struct BusSettingsBuilder {
    publishers: HashMap<TypeId, ErasedPublisherRegistration>,
    consumers: Vec<ConsumerRegistration>,
    request_response: Option<RequestResponseRegistration>,
}

impl BusSettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish<T: 'static>(mut self, spec: PublisherSpec<T>) -> Self {
        self.publishers
            .insert(TypeId::of::<T>(), ErasedPublisherRegistration::new(spec));
        self
    }

    pub fn subscribe_to<T: 'static>(mut self, spec: ConsumerSpec) -> Self {
        self.consumers.push(ConsumerRegistration {
            message_type: TypeTag::of::<T>(),
            response_type: None,
            topic: spec.topic,
            group: spec.group,
            kind: HandlerKind::Subscriber,
            handler_type_name: std::any::type_name::<T>(),
            instances: spec.instances,
            checkpoint: spec.checkpoint,
            properties: spec.properties,
        });
        self
    }

    pub fn handle<Req: 'static, Resp: 'static>(mut self, spec: ConsumerSpec) -> Self {
        self.consumers.push(ConsumerRegistration {
            message_type: TypeTag::of::<Req>(),
            response_type: Some(TypeTag::of::<Resp>()),
            topic: spec.topic,
            group: spec.group,
            kind: HandlerKind::RequestHandler,
            handler_type_name: std::any::type_name::<Req>(),
            instances: spec.instances,
            checkpoint: spec.checkpoint,
            properties: spec.properties,
        });
        self
    }

    pub fn expect_request_responses(mut self, spec: RequestResponseSpec) -> Self {
        self.request_response = Some(RequestResponseRegistration {
            reply_topic: spec.reply_topic,
            group: spec.group,
            default_timeout: spec.default_timeout,
        });
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<BusSettings, BusError> {
        for consumer in &self.consumers {
            if consumer.topic.is_empty() {
                return Err(BusError::InvalidConfiguration(format!(
                    "consumer registration for {} has an empty topic",
                    consumer.message_type
                )));
            }
            if consumer.group.is_empty() {
                return Err(BusError::InvalidConfiguration(format!(
                    "consumer registration for {} has an empty group",
                    consumer.message_type
                )));
            }
            if consumer.instances < 1 {
                return Err(BusError::InvalidConfiguration(format!(
                    "consumer registration for {} must have at least 1 instance",
                    consumer.message_type
                )));
            }
        }

        // Multiple consumers sharing a group must target different topics,
        // and (topic, group, messageType) must be unique per bus.
        let mut seen_group_topic: HashMap<(&str, &str), &TypeTag> = HashMap::new();
        for consumer in &self.consumers {
            let key = (consumer.group.as_str(), consumer.topic.as_str());
            if let Some(existing) = seen_group_topic.insert(key, &consumer.message_type) {
                if *existing == consumer.message_type {
                    return Err(BusError::InvalidConfiguration(format!(
                        "duplicate consumer registration for {} on (group='{}', topic='{}')",
                        consumer.message_type, consumer.group, consumer.topic
                    )));
                }
                return Err(BusError::InvalidConfiguration(format!(
                    "group '{}' already consumes topic '{}' for {}; \
                     consumers sharing a group must target different topics",
                    consumer.group, consumer.topic, existing
                )));
            }
        }

        if let Some(rr) = &self.request_response {
            if rr.reply_topic.is_empty() || rr.group.is_empty() {
                return Err(BusError::InvalidConfiguration(
                    "request/response registration requires a non-empty reply topic and group"
                        .to_string(),
                ));
            }
            let collides = self
                .consumers
                .iter()
                .any(|c| c.group == rr.group && c.topic == rr.reply_topic);
            if collides {
                return Err(BusError::InvalidConfiguration(format!(
                    "request/response (group='{}', topic='{}') collides with a consumer registration",
                    rr.group, rr.reply_topic
                )));
            }
        }

        Ok(BusSettings {
            publishers: self.publishers,
            consumers: self.consumers,
            request_response: self.request_response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OrderPlaced {
        id: u64,
    }
    struct EchoRequest;
    struct EchoResponse;

    #[test]
    fn rejects_empty_topic() {
        let err = BusSettingsBuilder::new()
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("", "group-a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_zero_instances() {
        let err = BusSettingsBuilder::new()
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("orders", "group-a").with_instances(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_shared_group_same_topic_different_types() {
        struct OtherEvent;
        let err = BusSettingsBuilder::new()
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("orders", "group-a"))
            .subscribe_to::<OtherEvent>(ConsumerSpec::new("orders", "group-a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_duplicate_registration_of_same_type_topic_group() {
        let err = BusSettingsBuilder::new()
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("orders", "group-a"))
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("orders", "group-a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn allows_shared_group_different_topics() {
        let settings = BusSettingsBuilder::new()
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("orders", "group-a"))
            .handle::<EchoRequest, EchoResponse>(ConsumerSpec::new("echo", "group-a"))
            .build()
            .unwrap();
        assert_eq!(settings.consumers.len(), 2);
    }

    #[test]
    fn rejects_request_response_colliding_with_consumer() {
        let err = BusSettingsBuilder::new()
            .subscribe_to::<OrderPlaced>(ConsumerSpec::new("replies", "rr-group"))
            .expect_request_responses(RequestResponseSpec::new("replies", "rr-group"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn publisher_key_selector_round_trips() {
        let settings = BusSettingsBuilder::new()
            .publish::<OrderPlaced>(
                PublisherSpec::new("orders").with_key_selector(|m: &OrderPlaced| Some(m.id.to_be_bytes().to_vec())),
            )
            .build()
            .unwrap();
        let spec = settings.publisher::<OrderPlaced>().unwrap();
        let key = (spec
            .key_selector
            .as_ref()
            .unwrap())(&OrderPlaced { id: 42 });
        assert_eq!(key, Some(42u64.to_be_bytes().to_vec()));
    }

    #[test]
    fn publisher_partition_selector_round_trips() {
        let settings = BusSettingsBuilder::new()
            .publish::<OrderPlaced>(PublisherSpec::new("orders").with_partition_selector(|_: &OrderPlaced| 10))
            .build()
            .unwrap();
        let spec = settings.publisher::<OrderPlaced>().unwrap();
        let partition = (spec.partition_selector_fn().unwrap())(&OrderPlaced { id: 42 });
        assert_eq!(partition, 10);
    }
}
