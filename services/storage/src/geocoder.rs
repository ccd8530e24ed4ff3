//! Reverse geocoding: capture coordinates to a parcel street address.
//!
//! [`VworldGeocoder`] calls the VWorld address API
//! (`GET /req/address?service=address&request=getAddress&point=<lon>,<lat>`)
//! and returns the text of the first parcel result.

use crate::config::GeocoderConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("Address request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Address provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Address provider error {code}: {message}")]
    Provider { code: String, message: String },

    #[error("No address found for ({longitude}, {latitude})")]
    NoResult { longitude: f64, latitude: f64 },

    #[error("Malformed address response: {0}")]
    Malformed(String),

    #[error("Geocoder closed")]
    Closed,
}

/// Coordinate to street address lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, longitude: f64, latitude: f64) -> Result<String, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct VworldEnvelope {
    response: VworldResponse,
}

#[derive(Debug, Deserialize)]
struct VworldResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<VworldError>,
    #[serde(default)]
    result: Vec<VworldResult>,
}

#[derive(Debug, Deserialize)]
struct VworldError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct VworldResult {
    #[serde(default)]
    text: String,
}

/// VWorld address API client
pub struct VworldGeocoder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    permits: Arc<Semaphore>,
}

impl VworldGeocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Reuse an existing client
    pub fn with_client(client: reqwest::Client, config: &GeocoderConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }
}

#[async_trait]
impl Geocoder for VworldGeocoder {
    #[instrument(skip(self))]
    async fn reverse_geocode(&self, longitude: f64, latitude: f64) -> Result<String, GeocodeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GeocodeError::Closed)?;

        let point = format!("{longitude},{latitude}");
        let response = self
            .client
            .get(format!("{}/req/address", self.base_url))
            .query(&[
                ("service", "address"),
                ("request", "getAddress"),
                ("key", self.api_key.as_str()),
                ("errorFormat", "json"),
                ("point", point.as_str()),
                ("type", "PARCEL"),
                ("simple", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeocodeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: VworldEnvelope = response
            .json()
            .await
            .map_err(|e| GeocodeError::Malformed(e.to_string()))?;

        let address = parse_address(envelope, longitude, latitude)?;
        debug!(address = %address, "Address resolved");
        Ok(address)
    }
}

fn parse_address(
    envelope: VworldEnvelope,
    longitude: f64,
    latitude: f64,
) -> Result<String, GeocodeError> {
    let response = envelope.response;

    if response.status.eq_ignore_ascii_case("ERROR") {
        let (code, message) = response
            .error
            .map(|e| (e.code, e.text))
            .unwrap_or_else(|| ("UNKNOWN".to_string(), String::new()));
        return Err(GeocodeError::Provider { code, message });
    }

    let text = response
        .result
        .into_iter()
        .next()
        .map(|r| r.text.trim().to_string())
        .filter(|text| !text.is_empty());

    text.ok_or(GeocodeError::NoResult {
        longitude,
        latitude,
    })
}
