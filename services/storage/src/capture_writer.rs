//! Capture persistence writer: consumes processed capture events and stores
//! them as capture points.
//!
//! Per event:
//!
//! 1. reverse geocode the capture location to a street address;
//! 2. resolve the administrative region for that address;
//! 3. build the capture point (fresh public id, image URL, risk, region);
//! 4. attach one `Reported` damage per detection;
//! 5. persist the capture point and its damages as one unit.
//!
//! Nothing is written unless every step succeeds. Only transient storage
//! failures are redelivered; lookup, region, location and data errors are
//! logged and skipped.

use crate::capture_store::{CaptureRepository, PersistOutcome, StoreError};
use crate::geocoder::{GeocodeError, Geocoder};
use crate::model::{CapturePoint, GeoPoint, ModelError};
use crate::region::{RegionError, RegionResolver};
use metrics::counter;
use roadscan_pipeline::{
    async_trait, storage_key_for, CaptureEvent, ConsumerError, IncomingMessage, MessageHandler,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Address lookup failed for ({longitude}, {latitude}): {source}")]
    AddressLookup {
        longitude: f64,
        latitude: f64,
        #[source]
        source: GeocodeError,
    },

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("Invalid capture location: {0}")]
    InvalidLocation(#[from] ModelError),

    #[error("Failed to store capture: {0}")]
    Store(#[from] StoreError),
}

impl WriterError {
    /// Only transient storage failures are redelivered
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriterError::Store(e) if e.is_transient())
    }
}

pub struct CaptureWriter {
    geocoder: Arc<dyn Geocoder>,
    regions: Arc<RegionResolver>,
    store: Arc<dyn CaptureRepository>,
    image_base_url: String,
}

impl CaptureWriter {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        regions: Arc<RegionResolver>,
        store: Arc<dyn CaptureRepository>,
        image_base_url: impl Into<String>,
    ) -> Self {
        Self {
            geocoder,
            regions,
            store,
            image_base_url: image_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Image URL for a processed event, built from its storage key
    pub fn image_url(&self, event: &CaptureEvent) -> String {
        let key = event
            .image_info
            .image_url
            .clone()
            .unwrap_or_else(|| storage_key_for(event.image_id()));

        if self.image_base_url.is_empty() {
            key
        } else {
            format!("{}/{}", self.image_base_url, key.trim_start_matches('/'))
        }
    }

    /// Build and persist the capture point for one processed event
    pub async fn write(&self, event: &CaptureEvent) -> Result<PersistOutcome, WriterError> {
        let longitude = event.location.longitude;
        let latitude = event.location.latitude;

        let address = self
            .geocoder
            .reverse_geocode(longitude, latitude)
            .await
            .map_err(|source| WriterError::AddressLookup {
                longitude,
                latitude,
                source,
            })?;

        let region = self.regions.resolve(&address)?;
        let location = GeoPoint::new(longitude, latitude)?;

        let mut capture = CapturePoint::new(
            event.image_id(),
            event.captured_at,
            location,
            address,
            region.id,
            self.image_url(event),
        )
        .with_accuracy(event.location.accuracy_meters)
        .with_risk(event.image_info.risk);

        for detection in event.detections() {
            let name = detection.category_name.trim();
            if name.is_empty() {
                warn!(capture_id = %event.image_id(), "Skipping detection without category");
                continue;
            }
            capture.add_damage(name, None);
        }

        Ok(self.store.persist(&capture).await?)
    }
}

#[async_trait]
impl MessageHandler for CaptureWriter {
    #[instrument(
        skip(self, message),
        fields(partition = message.metadata.partition, offset = message.metadata.offset)
    )]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let event: CaptureEvent = message.decode_json()?;

        match self.write(&event).await {
            Ok(PersistOutcome::Created {
                capture_point_id,
                damages,
            }) => {
                counter!("storage.captures.persisted").increment(1);
                info!(
                    capture_id = %event.image_id(),
                    capture_point_id,
                    damages,
                    "Capture persisted"
                );
                Ok(())
            }
            Ok(PersistOutcome::Duplicate) => {
                counter!("storage.captures.duplicate").increment(1);
                info!(capture_id = %event.image_id(), "Capture already persisted, skipping");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                counter!("storage.captures.retried").increment(1);
                warn!(capture_id = %event.image_id(), error = %e, "Capture not stored, will retry");
                Err(ConsumerError::Retryable(e.to_string()))
            }
            Err(e) => Err(ConsumerError::Fatal(e.to_string())),
        }
    }

    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        counter!("storage.captures.failed").increment(1);
        error!(
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            key = ?message.key_str(),
            error = %error,
            "Dropping processed capture event"
        );
    }
}
