//! Presign stage: turns raw capture events into presigned capture events.
//!
//! For each raw event the stage asks the [`PresignGateway`] for an upload URL
//! scoped to `<uuid>.jpg` and forwards a presigned event carrying the
//! original timestamp and location. Gateway and publish failures are
//! retryable, so the raw event is redelivered; an undecodable envelope is
//! logged and skipped.

use crate::object_storage::{GatewayError, PresignGateway};
use metrics::counter;
use roadscan_pipeline::{
    async_trait, storage_key_for, CaptureEvent, ConsumerError, EventPublisher, IncomingMessage,
    MessageHandler, ProducerError,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PresignStageError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Publish(#[from] ProducerError),
}

/// Consumer handler for the raw topic
pub struct PresignHandler {
    gateway: Arc<dyn PresignGateway>,
    publisher: Arc<dyn EventPublisher>,
    presigned_topic: String,
}

impl PresignHandler {
    pub fn new(
        gateway: Arc<dyn PresignGateway>,
        publisher: Arc<dyn EventPublisher>,
        presigned_topic: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            publisher,
            presigned_topic: presigned_topic.into(),
        }
    }

    /// Presign the upload for a raw event and publish the presigned event
    pub async fn forward(&self, raw: &CaptureEvent) -> Result<CaptureEvent, PresignStageError> {
        let key = storage_key_for(raw.image_id());
        let upload = self.gateway.presign_put(&key).await?;
        counter!("ingest.presign.issued").increment(1);

        let presigned = raw.presigned(upload.url, upload.key);
        self.publisher
            .publish(&self.presigned_topic, &presigned)
            .await?;

        debug!(expires_at = %upload.expires_at, "Presigned capture event published");
        Ok(presigned)
    }
}

#[async_trait]
impl MessageHandler for PresignHandler {
    #[instrument(
        skip(self, message),
        fields(partition = message.metadata.partition, offset = message.metadata.offset)
    )]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let raw: CaptureEvent = message.decode_json()?;

        match self.forward(&raw).await {
            Ok(presigned) => {
                info!(
                    capture_id = %presigned.image_id(),
                    key = ?presigned.image_info.image_url,
                    "Capture presigned"
                );
                Ok(())
            }
            Err(e) => {
                counter!("ingest.presign.failed").increment(1);
                warn!(capture_id = %raw.image_id(), error = %e, "Presign failed");
                Err(ConsumerError::Retryable(e.to_string()))
            }
        }
    }

    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        counter!("ingest.presign.skipped").increment(1);
        warn!(
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Skipping raw capture event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_storage::{MockPresignGateway, PresignedUpload};
    use crate::test_support::RecordingPublisher;
    use chrono::{TimeZone, Utc};
    use roadscan_pipeline::{Location, MessageMetadata};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn raw_event(id: Uuid) -> CaptureEvent {
        CaptureEvent::raw(
            id,
            Location {
                latitude: 36.35,
                longitude: 127.38,
                accuracy_meters: Some(3.0),
            },
            Utc.with_ymd_and_hms(2025, 5, 1, 9, 30, 0).unwrap(),
        )
    }

    fn incoming(payload: Vec<u8>) -> IncomingMessage {
        IncomingMessage {
            payload,
            metadata: MessageMetadata {
                topic: "raw-topic".to_string(),
                partition: 2,
                offset: 41,
                key: None,
                timestamp: None,
                headers: HashMap::new(),
            },
        }
    }

    fn issuing_gateway() -> MockPresignGateway {
        let mut gateway = MockPresignGateway::new();
        gateway.expect_presign_put().times(1).returning(|key| {
            Ok(PresignedUpload {
                url: format!("https://bucket.example/{key}?X-Amz-Signature=sig"),
                key: key.to_string(),
                expires_at: Utc::now(),
            })
        });
        gateway
    }

    #[tokio::test]
    async fn test_presigned_event_keeps_capture_metadata() {
        let id = Uuid::new_v4();
        let raw = raw_event(id);
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = PresignHandler::new(
            Arc::new(issuing_gateway()),
            publisher.clone(),
            "presigned-topic",
        );

        handler
            .handle(incoming(serde_json::to_vec(&raw).unwrap()))
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let (topic, event) = &published[0];
        assert_eq!(topic, "presigned-topic");
        assert_eq!(event.image_info.image_url, Some(format!("{id}.jpg")));
        assert_eq!(
            event.image_info.presigned_url,
            Some(format!("https://bucket.example/{id}.jpg?X-Amz-Signature=sig"))
        );
        assert_eq!(event.image_info.risk, None);
        assert_eq!(event.captured_at, raw.captured_at);
        assert_eq!(event.location, raw.location);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_retryable_and_not_forwarded() {
        let mut gateway = MockPresignGateway::new();
        gateway.expect_presign_put().returning(|key| {
            Err(GatewayError::Presign {
                key: key.to_string(),
                message: "connection refused".to_string(),
            })
        });
        let publisher = Arc::new(RecordingPublisher::default());
        let handler = PresignHandler::new(Arc::new(gateway), publisher.clone(), "presigned-topic");

        let raw = raw_event(Uuid::new_v4());
        let err = handler
            .handle(incoming(serde_json::to_vec(&raw).unwrap()))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_retryable() {
        let handler = PresignHandler::new(
            Arc::new(issuing_gateway()),
            Arc::new(RecordingPublisher::failing()),
            "presigned-topic",
        );

        let raw = raw_event(Uuid::new_v4());
        let err = handler
            .handle(incoming(serde_json::to_vec(&raw).unwrap()))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_undecodable_event_is_skipped_without_presigning() {
        let mut gateway = MockPresignGateway::new();
        gateway.expect_presign_put().never();
        let handler = PresignHandler::new(
            Arc::new(gateway),
            Arc::new(RecordingPublisher::default()),
            "presigned-topic",
        );

        let err = handler
            .handle(incoming(br#"{"image_info": {}}"#.to_vec()))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
    }
}
