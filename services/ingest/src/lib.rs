//! Roadscan Ingest Service
//!
//! Front half of the capture pipeline:
//!
//! ```text
//! device ──POST /api/upload──▶ UploadIntake ──▶ raw-topic
//!                                   │
//!                                   ▼
//!                           /mnt/image-buffer/<uuid>.jpg
//!
//! raw-topic ──▶ PresignHandler ──▶ PresignGateway (S3) ──▶ presigned-topic
//! ```
//!
//! The intake side only writes the image locally and announces it; the
//! presign stage runs on its own runtime so slow object storage calls never
//! hold up uploads.

pub mod api;
pub mod buffer;
pub mod config;
pub mod intake;
pub mod object_storage;
pub mod presign_stage;

#[cfg(test)]
mod test_support;

pub use buffer::{BufferError, BufferedImage, ImageBuffer};
pub use config::IngestConfig;
pub use intake::{Coordinates, IntakeError, UploadIntake};
pub use object_storage::{GatewayError, PresignGateway, PresignedUpload, S3Gateway};
pub use presign_stage::{PresignHandler, PresignStageError};
