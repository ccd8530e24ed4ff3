//! Roadscan Storage Service
//!
//! Back half of the capture pipeline. Processed capture events (detections
//! plus risk from the inference service) are turned into capture points
//! classified by administrative region and stored in PostgreSQL/PostGIS.
//!
//! ## Architecture
//!
//! ```text
//! processed-topic
//!        │
//!        ▼
//! ┌──────────────┐   (lon, lat)   ┌──────────────┐
//! │ Capture      │───────────────▶│ Geocoder     │  VWorld address API
//! │ Writer       │◀───────────────│              │
//! └──────────────┘    address     └──────────────┘
//!        │
//!        │ address      ┌──────────────┐
//!        ├─────────────▶│ Region       │  in-memory region tree
//!        │◀─────────────│ Resolver     │
//!        │   region     └──────────────┘
//!        ▼
//! ┌──────────────┐
//! │ Capture      │  capture_point, capture_damage, damage_category
//! │ Store        │
//! └──────────────┘
//! ```

pub mod capture_store;
pub mod capture_writer;
pub mod config;
pub mod geocoder;
pub mod model;
pub mod region;

#[cfg(test)]
mod test_support;

pub use capture_store::{CaptureRepository, PersistOutcome, PgCaptureStore, StoreError};
pub use capture_writer::{CaptureWriter, WriterError};
pub use config::Config;
pub use geocoder::{GeocodeError, Geocoder, VworldGeocoder};
pub use model::{CaptureDamage, CapturePoint, DamageStatus, GeoPoint, ModelError};
pub use region::{Region, RegionError, RegionRecord, RegionResolver, RegionTree};
