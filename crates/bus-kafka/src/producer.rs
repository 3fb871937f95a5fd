use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, warn};

use bus_core::{BusError, EnvelopeHeader, OutgoingRecord, Transport};

use crate::config::KafkaSettings;

/// Header key a record's `EnvelopeHeader`, if any, is encoded under. Chosen
/// so a consumer can cheaply check for its presence before paying for a
/// JSON decode.
pub const ENVELOPE_HEADER_KEY: &str = "bus-envelope";

/// Producer-side half of the Kafka transport. Configuration mirrors
/// `kafka-service/src/producer.rs`'s `MessageProducer`: idempotent
/// producer, `acks=all`, zstd compression, small linger for batching.
pub struct KafkaTransport {
    producer: FutureProducer,
    delivery_timeout: std::time::Duration,
}

impl KafkaTransport {
    pub fn new(settings: &KafkaSettings) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("client.id", &settings.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("retries", "10")
            .set("retry.backoff.ms", "1000")
            .set("compression.type", "zstd")
            .set("batch.size", "65536")
            .set("linger.ms", "5")
            .set("buffer.memory", "33554432")
            .create()
            .map_err(|e| BusError::InvalidConfiguration(format!("failed to create Kafka producer: {e}")))?;

        Ok(Self {
            producer,
            delivery_timeout: settings.producer_delivery_timeout,
        })
    }
}

/// Encode an `EnvelopeHeader` as the single JSON-valued record header,
/// carried out-of-band for transports whose wire format supports headers.
pub(crate) fn encode_envelope(header: &EnvelopeHeader) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(header).map_err(|e| BusError::SerializationFailed(e.to_string()))
}

pub(crate) fn decode_envelope(bytes: &[u8]) -> Result<EnvelopeHeader, BusError> {
    serde_json::from_slice(bytes).map_err(|e| BusError::SerializationFailed(e.to_string()))
}

fn owned_headers_for(record: &OutgoingRecord) -> Result<Option<OwnedHeaders>, BusError> {
    match &record.header {
        None => Ok(None),
        Some(header) => {
            let encoded = encode_envelope(header)?;
            Ok(Some(OwnedHeaders::new().insert(Header {
                key: ENVELOPE_HEADER_KEY,
                value: Some(&encoded),
            })))
        }
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn publish_to_transport(&self, record: OutgoingRecord) -> Result<(), BusError> {
        let headers = owned_headers_for(&record)?;

        let mut future_record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
            FutureRecord::to(&record.topic).payload(&record.payload);
        if let Some(key) = record.key.as_ref() {
            future_record = future_record.key(key);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }
        if let Some(headers) = headers {
            future_record = future_record.headers(headers);
        }

        match self.producer.send(future_record, Timeout::After(self.delivery_timeout)).await {
            Ok((partition, offset)) => {
                debug!(topic = %record.topic, partition, offset, "published record");
                Ok(())
            }
            Err((kafka_error, _owned_message)) => {
                let code = kafka_error
                    .rdkafka_error_code()
                    .map(|c| c as i32)
                    .unwrap_or(-1);
                Err(BusError::publish_failed(code, kafka_error.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        let producer = self.producer.clone();
        let flush_result = tokio::task::spawn_blocking(move || producer.flush(std::time::Duration::from_secs(10)))
            .await
            .map_err(|e| BusError::InvalidConfiguration(format!("producer flush task panicked: {e}")))?;

        match flush_result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("failed to flush Kafka producer during close: {}", e);
                Err(BusError::publish_failed(-1, e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::CorrelationId;

    #[test]
    fn envelope_header_round_trips_through_bytes() {
        let header = EnvelopeHeader::for_request("replies".to_string(), 1_000);
        let encoded = encode_envelope(&header).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded.correlation_id, header.correlation_id);
        assert_eq!(decoded.reply_to, header.reply_to);
        assert_eq!(decoded.expires_at_ms, header.expires_at_ms);
    }

    #[test]
    fn response_header_carries_fault_message() {
        let header = EnvelopeHeader::for_response(CorrelationId::new(), Some("boom".to_string()));
        let encoded = encode_envelope(&header).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert!(decoded.is_fault());
        assert_eq!(decoded.fault.as_deref(), Some("boom"));
    }

    #[test]
    fn owned_headers_absent_when_record_has_no_envelope() {
        let record = OutgoingRecord {
            topic: "orders".to_string(),
            key: None,
            partition: None,
            header: None,
            payload: b"{}".to_vec(),
        };
        assert!(owned_headers_for(&record).unwrap().is_none());
    }

    #[test]
    fn owned_headers_present_when_record_has_envelope() {
        let record = OutgoingRecord {
            topic: "orders".to_string(),
            key: None,
            partition: None,
            header: Some(EnvelopeHeader::for_request("replies".to_string(), 1_000)),
            payload: b"{}".to_vec(),
        };
        assert!(owned_headers_for(&record).unwrap().is_some());
    }
}
