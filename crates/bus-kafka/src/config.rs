use std::time::Duration;

/// Kafka-specific knobs. `BusSettings` (from `bus-core`) carries the
/// transport-agnostic registrations; this carries what only makes sense for
/// a Kafka deployment — bootstrap servers, client id, and the session/
/// delivery timeouts `rdkafka` expects as strings.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub client_id: String,
    pub session_timeout_ms: u32,
    pub heartbeat_interval_ms: u32,
    pub max_poll_interval_ms: u32,
    pub producer_delivery_timeout: Duration,
    pub poll_timeout: Duration,
}

impl KafkaSettings {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: "bus-kafka".to_string(),
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            max_poll_interval_ms: 300_000,
            producer_delivery_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
        }
    }

    /// Load from the environment, matching `kafka-service/src/config.rs`'s
    /// `dotenv`-then-`env::var` pattern. Panics (via `expect`) on malformed
    /// numeric values — this runs once at process startup, before any bus
    /// traffic flows.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut settings = Self::new(
            std::env::var("BUS_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
        );

        if let Ok(client_id) = std::env::var("BUS_KAFKA_CLIENT_ID") {
            settings.client_id = client_id;
        }
        if let Ok(v) = std::env::var("BUS_KAFKA_SESSION_TIMEOUT_MS") {
            settings.session_timeout_ms = v.parse().expect("BUS_KAFKA_SESSION_TIMEOUT_MS must be a valid number");
        }
        if let Ok(v) = std::env::var("BUS_KAFKA_HEARTBEAT_INTERVAL_MS") {
            settings.heartbeat_interval_ms = v.parse().expect("BUS_KAFKA_HEARTBEAT_INTERVAL_MS must be a valid number");
        }
        if let Ok(v) = std::env::var("BUS_KAFKA_MAX_POLL_INTERVAL_MS") {
            settings.max_poll_interval_ms = v.parse().expect("BUS_KAFKA_MAX_POLL_INTERVAL_MS must be a valid number");
        }
        if let Ok(v) = std::env::var("BUS_KAFKA_PRODUCER_DELIVERY_TIMEOUT_MS") {
            let ms: u64 = v.parse().expect("BUS_KAFKA_PRODUCER_DELIVERY_TIMEOUT_MS must be a valid number");
            settings.producer_delivery_timeout = Duration::from_millis(ms);
        }

        settings
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_producer_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.producer_delivery_timeout = timeout;
        self
    }
}
