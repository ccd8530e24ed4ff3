//! Roadscan Pipeline - Kafka plumbing for the road-damage capture flow
//!
//! This library carries capture events between the stages of the Roadscan
//! platform:
//!
//! - `raw-topic`: an uploaded image has been buffered locally
//! - `presigned-topic`: an upload URL has been issued for the image
//! - `processed-topic`: the inference service has scored the image
//!
//! Every topic carries the same [`CaptureEvent`] envelope, keyed by the
//! image identifier.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roadscan_pipeline::prelude::*;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
//!         let event: CaptureEvent = message.decode_json()?;
//!         println!("{}", event.image_id());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KafkaConfig::new("localhost:9092").with_group_id("printer");
//!     let group = ConsumerGroup::new(&config, &[config.topics.processed.as_str()])?;
//!     let handles = group.spawn(Arc::new(Printer), &tokio::runtime::Handle::current());
//!     futures::future::join_all(handles).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod events;
pub mod producer;

pub use async_trait::async_trait;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, SaslMechanism, SecurityConfig,
    SecurityProtocol, TopicConfig,
};
pub use consumer::{
    CaptureConsumer, ConsumerError, ConsumerGroup, Disposition, IncomingMessage, MessageHandler,
    MessageMetadata,
};
pub use events::{storage_key_for, CaptureEvent, Detection, ImageInfo, Location};
pub use producer::{
    CaptureProducer, DeliveryResult, EventPublisher, OutgoingMessage, ProducerError,
    CAPTURE_EVENT_TYPE, MESSAGE_TYPE_HEADER,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::async_trait;
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{ConsumerError, ConsumerGroup, IncomingMessage, MessageHandler};
    pub use crate::events::{CaptureEvent, Detection, Location};
    pub use crate::producer::{CaptureProducer, EventPublisher, ProducerError};
}
