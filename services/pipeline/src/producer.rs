//! Kafka producer for capture events.
//!
//! Capture events are serialized as JSON and keyed by their image
//! identifier, so every stage of one capture lands on the same partition.

use crate::config::KafkaConfig;
use crate::events::CaptureEvent;
use async_trait::async_trait;
use metrics::counter;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Header naming the payload schema
pub const MESSAGE_TYPE_HEADER: &str = "message-type";
pub const CAPTURE_EVENT_TYPE: &str = "capture_event";

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Where a message was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// An encoded capture event ready to send
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partition key, the image identifier
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

impl OutgoingMessage {
    pub fn capture_event(
        topic: impl Into<String>,
        event: &CaptureEvent,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;

        Ok(Self {
            topic: topic.into(),
            key: event.message_key(),
            payload,
            headers: vec![(MESSAGE_TYPE_HEADER, CAPTURE_EVENT_TYPE.to_string())],
        })
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (name, value)| {
                headers.insert(Header {
                    key: name,
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Publishes capture events to a topic.
///
/// Implemented by [`CaptureProducer`]; stages depend on this trait so they
/// can be exercised without a broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &CaptureEvent) -> Result<(), ProducerError>;
}

pub struct CaptureProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl CaptureProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            servers = %config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            delivery_timeout: config.request_timeout(),
        })
    }

    /// Send a message and wait for the broker to acknowledge it
    #[instrument(skip(self, message), fields(topic = %message.topic, key = %message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(message.owned_headers());

        let delivered = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await;

        match delivered {
            Ok((partition, offset)) => {
                counter!("pipeline.events.published", "topic" => message.topic.clone())
                    .increment(1);
                debug!(partition, offset, bytes = message.payload.len(), "Message delivered");
                Ok(DeliveryResult {
                    topic: message.topic,
                    partition,
                    offset,
                })
            }
            Err((e, _)) => {
                counter!("pipeline.events.publish_failed", "topic" => message.topic.clone())
                    .increment(1);
                Err(ProducerError::SendError {
                    topic: message.topic,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }

    /// Messages handed to the client but not yet acknowledged
    pub fn queue_len(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }
}

#[async_trait]
impl EventPublisher for CaptureProducer {
    async fn publish(&self, topic: &str, event: &CaptureEvent) -> Result<(), ProducerError> {
        let message = OutgoingMessage::capture_event(topic, event)?;
        self.send(message).await.map(|_| ())
    }
}

impl Drop for CaptureProducer {
    fn drop(&mut self) {
        if self.queue_len() == 0 {
            return;
        }
        info!(pending = self.queue_len(), "Flushing Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Location;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_capture_event_message_is_keyed_by_image_id() {
        let id = Uuid::new_v4();
        let event = CaptureEvent::raw(
            id,
            Location {
                latitude: 36.35,
                longitude: 127.38,
                accuracy_meters: None,
            },
            Utc::now(),
        );

        let message = OutgoingMessage::capture_event("raw-topic", &event).unwrap();

        assert_eq!(message.topic, "raw-topic");
        assert_eq!(message.key, id.to_string());
        assert_eq!(
            message.headers,
            vec![(MESSAGE_TYPE_HEADER, CAPTURE_EVENT_TYPE.to_string())]
        );
        let decoded: CaptureEvent = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, event);
    }
}
