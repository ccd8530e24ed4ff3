//! Upload intake: buffers a capture image locally and announces it on the raw topic.

use crate::buffer::{BufferError, BufferWriter, BufferedImage, ImageBuffer};
use axum::http::StatusCode;
use chrono::Utc;
use metrics::counter;
use roadscan_pipeline::{CaptureEvent, EventPublisher, Location, ProducerError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Errors surfaced to the uploading client
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Missing form part: {0}")]
    MissingPart(&'static str),

    #[error("Duplicate form part: {0}")]
    DuplicatePart(&'static str),

    #[error("Invalid {field}: {value:?} is not a number")]
    InvalidCoordinate { field: &'static str, value: String },

    #[error("{field} {value} is outside [{min}, {max}]")]
    CoordinateOutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Malformed upload: {message}")]
    Transfer { status: StatusCode, message: String },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Failed to publish raw capture event: {0}")]
    Publish(#[from] ProducerError),
}

impl IntakeError {
    /// HTTP status reported to the client
    pub fn status(&self) -> StatusCode {
        match self {
            IntakeError::MissingPart(_)
            | IntakeError::DuplicatePart(_)
            | IntakeError::InvalidCoordinate { .. }
            | IntakeError::CoordinateOutOfRange { .. } => StatusCode::BAD_REQUEST,
            IntakeError::Transfer { status, .. } => *status,
            IntakeError::Buffer(BufferError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            IntakeError::Buffer(BufferError::Io { .. }) | IntakeError::Publish(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Validated capture coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Parse the string-encoded form parts
    pub fn parse(latitude: Option<&str>, longitude: Option<&str>) -> Result<Self, IntakeError> {
        let latitude = parse_axis("latitude", latitude, 90.0)?;
        let longitude = parse_axis("longitude", longitude, 180.0)?;
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

fn parse_axis(field: &'static str, raw: Option<&str>, bound: f64) -> Result<f64, IntakeError> {
    let raw = raw.ok_or(IntakeError::MissingPart(field))?;
    let value: f64 = raw
        .trim()
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| IntakeError::InvalidCoordinate {
            field,
            value: raw.to_string(),
        })?;

    if !(-bound..=bound).contains(&value) {
        return Err(IntakeError::CoordinateOutOfRange {
            field,
            value,
            min: -bound,
            max: bound,
        });
    }
    Ok(value)
}

/// Accepts uploaded captures and emits raw capture events
pub struct UploadIntake {
    buffer: ImageBuffer,
    publisher: Arc<dyn EventPublisher>,
    raw_topic: String,
}

impl UploadIntake {
    pub fn new(
        buffer: ImageBuffer,
        publisher: Arc<dyn EventPublisher>,
        raw_topic: impl Into<String>,
    ) -> Self {
        Self {
            buffer,
            publisher,
            raw_topic: raw_topic.into(),
        }
    }

    pub fn buffer(&self) -> &ImageBuffer {
        &self.buffer
    }

    /// Start buffering the image for a new capture
    pub async fn open_image(&self, id: Uuid) -> Result<BufferWriter, IntakeError> {
        Ok(self.buffer.create(id).await?)
    }

    /// Publish the raw capture event for a fully buffered image.
    ///
    /// The buffered file is removed if the event cannot be published.
    #[instrument(skip(self, image), fields(capture_id = %image.id, topic = %self.raw_topic))]
    pub async fn emit(
        &self,
        image: BufferedImage,
        coordinates: Coordinates,
    ) -> Result<CaptureEvent, IntakeError> {
        let event = CaptureEvent::raw(
            image.id,
            Location {
                latitude: coordinates.latitude,
                longitude: coordinates.longitude,
                accuracy_meters: None,
            },
            Utc::now(),
        );

        if let Err(e) = self.publisher.publish(&self.raw_topic, &event).await {
            warn!(error = %e, "Raw capture event not published, dropping buffered image");
            self.buffer.discard(image.id).await;
            return Err(e.into());
        }

        counter!("ingest.uploads.accepted").increment(1);
        info!(
            size_bytes = image.size_bytes,
            latitude = coordinates.latitude,
            longitude = coordinates.longitude,
            "Capture accepted"
        );

        Ok(event)
    }

    /// Drop whatever was buffered for a failed upload
    pub async fn abandon(&self, id: Uuid, error: &IntakeError) {
        counter!("ingest.uploads.rejected").increment(1);
        warn!(capture_id = %id, error = %error, "Upload rejected");
        self.buffer.discard(id).await;
    }
}
