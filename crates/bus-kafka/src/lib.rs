//! Kafka transport for the message bus: producer wrapper, partition
//! processors, group consumer, commit controller, and the builder wiring
//! that turns `bus_core::BusSettings` registrations into running Kafka
//! consumer groups.
//!
//! The Redis transport and the trivial in-memory transport are out of
//! scope here — see `bus_core::memory_transport` for the test-only stand-in
//! used by `bus-core`'s own integration tests.

pub mod builder;
pub mod bus;
pub mod commit;
pub mod config;
pub mod consumer_context;
pub mod group_consumer;
pub mod processor;
pub mod producer;

pub use builder::{KafkaBusBuilder, MessageHandler, RequestHandler};
pub use bus::KafkaMessageBus;
pub use commit::CommitController;
pub use config::KafkaSettings;
pub use consumer_context::KafkaConsumerContext;
pub use group_consumer::KafkaGroupConsumer;
pub use processor::{KafkaMessage, PartitionProcessor};
pub use producer::KafkaTransport;
