//! Transport-agnostic core of the message bus: configuration/registration,
//! request/response correlation with timeouts, and the base publish/send/
//! reply contract that concrete transports (Kafka, Redis, in-memory) build
//! on top of.
//!
//! Serialization, dependency resolution, and the concrete transports
//! themselves are external collaborators — see [`capability::Serializer`]
//! and [`capability::Resolver`].

pub mod bus;
pub mod capability;
pub mod checkpoint;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod memory_transport;
pub mod settings;

pub use bus::{MessageBusBase, OutgoingRecord, Transport};
pub use capability::{JsonSerializer, MapResolver, MapResolverBuilder, Resolver, Serializer};
pub use checkpoint::CheckpointTrigger;
pub use correlation::CorrelationRegistry;
pub use envelope::{CorrelationId, EnvelopeHeader};
pub use error::BusError;
pub use settings::{
    BusSettings, BusSettingsBuilder, CheckpointSpec, ConsumerRegistration, ConsumerSpec,
    HandlerKind, PublisherSpec, RequestResponseRegistration, RequestResponseSpec, TypeTag,
};
