//! Capture event envelope carried across the raw, presigned and processed topics.
//!
//! The same envelope travels through every stage and is filled in
//! progressively: intake sets the timestamp, location and image identifier,
//! the presign stage adds the upload URL and storage key, and the inference
//! service adds the risk score and detections. Fields that a stage has not
//! populated yet are omitted from the JSON entirely rather than written as
//! `null`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix appended to the image identifier to form the storage object key.
pub const IMAGE_KEY_SUFFIX: &str = ".jpg";

/// Capture event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// When the device captured the image (UTC)
    #[serde(rename = "capture_timestamp_utc", with = "utc_timestamp")]
    pub captured_at: DateTime<Utc>,
    /// Where the image was captured
    pub location: Location,
    /// Image reference, progressively filled by each stage
    pub image_info: ImageInfo,
    /// Detections reported by the inference service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,
}

/// Capture location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters
    #[serde(
        default,
        alias = "accuracyMeters",
        skip_serializing_if = "Option::is_none"
    )]
    pub accuracy_meters: Option<f64>,
}

/// Image reference block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Identifier generated at upload time
    pub uuid: Uuid,
    /// Time-limited upload URL issued by the presign stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presigned_url: Option<String>,
    /// Object storage key the image is uploaded under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Aggregate risk score from the inference service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
}

/// A single detection emitted by the inference service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub category_name: String,
}

impl Detection {
    pub fn new(category_name: impl Into<String>) -> Self {
        Self {
            category_name: category_name.into(),
        }
    }
}

impl CaptureEvent {
    /// Build the raw event emitted by upload intake.
    pub fn raw(image_id: Uuid, location: Location, captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            location,
            image_info: ImageInfo {
                uuid: image_id,
                presigned_url: None,
                image_url: None,
                risk: None,
            },
            detections: None,
        }
    }

    /// Derive the presigned event for this capture.
    ///
    /// Timestamp and location are carried over unchanged; risk and
    /// detections are cleared since the image has not been processed yet.
    pub fn presigned(&self, presigned_url: impl Into<String>, storage_key: impl Into<String>) -> Self {
        Self {
            captured_at: self.captured_at,
            location: self.location,
            image_info: ImageInfo {
                uuid: self.image_info.uuid,
                presigned_url: Some(presigned_url.into()),
                image_url: Some(storage_key.into()),
                risk: None,
            },
            detections: None,
        }
    }

    /// Image identifier, also used as the message key on every topic.
    pub fn image_id(&self) -> Uuid {
        self.image_info.uuid
    }

    /// Partition key for this capture.
    pub fn message_key(&self) -> String {
        self.image_info.uuid.to_string()
    }

    /// Detections, treating an absent list as empty.
    pub fn detections(&self) -> &[Detection] {
        self.detections.as_deref().unwrap_or(&[])
    }
}

/// Storage object key for an image identifier.
pub fn storage_key_for(image_id: Uuid) -> String {
    format!("{image_id}{IMAGE_KEY_SUFFIX}")
}

/// Timestamp codec: writes RFC 3339 UTC, reads RFC 3339 or a zone-less
/// ISO-8601 local timestamp taken as UTC.
mod utc_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&s) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_location() -> Location {
        Location {
            latitude: 36.35,
            longitude: 127.38,
            accuracy_meters: None,
        }
    }

    #[test]
    fn test_raw_event_omits_unset_fields() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 9, 30, 0).unwrap();
        let event = CaptureEvent::raw(id, sample_location(), at);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["capture_timestamp_utc"], "2025-05-01T09:30:00.000Z");
        assert_eq!(value["image_info"]["uuid"], id.to_string());
        assert!(value["image_info"].get("presigned_url").is_none());
        assert!(value["image_info"].get("image_url").is_none());
        assert!(value["image_info"].get("risk").is_none());
        assert!(value["location"].get("accuracy_meters").is_none());
        assert!(value.get("detections").is_none());
    }

    #[test]
    fn test_presigned_keeps_timestamp_and_location() {
        let id = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 9, 30, 0).unwrap();
        let raw = CaptureEvent::raw(id, sample_location(), at);

        let presigned = raw.presigned("https://bucket/put?sig=1", storage_key_for(id));

        assert_eq!(presigned.captured_at, raw.captured_at);
        assert_eq!(presigned.location, raw.location);
        assert_eq!(presigned.image_info.uuid, id);
        assert_eq!(presigned.image_info.image_url, Some(format!("{id}.jpg")));
        assert_eq!(presigned.image_info.risk, None);
    }

    #[test]
    fn test_deserialize_processed_message_with_naive_timestamp() {
        let json = r#"{
            "capture_timestamp_utc": "2025-05-01T09:30:00.123",
            "location": {"latitude": 36.35, "longitude": 127.38, "accuracyMeters": 4.5},
            "image_info": {
                "uuid": "550e8400-e29b-41d4-a716-446655440000",
                "image_url": "550e8400-e29b-41d4-a716-446655440000.jpg",
                "risk": 0.82,
                "model": "ignored"
            },
            "detections": [{"category_name": "crack"}, {"category_name": "pothole"}],
            "extra": true
        }"#;

        let event: CaptureEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.location.accuracy_meters, Some(4.5));
        assert_eq!(event.image_info.risk, Some(0.82));
        assert_eq!(event.detections().len(), 2);
        assert_eq!(event.captured_at.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_missing_detections_reads_as_empty() {
        let json = r#"{
            "capture_timestamp_utc": "2025-05-01T09:30:00Z",
            "location": {"latitude": 1.0, "longitude": 2.0},
            "image_info": {"uuid": "550e8400-e29b-41d4-a716-446655440000"}
        }"#;

        let event: CaptureEvent = serde_json::from_str(json).unwrap();
        assert!(event.detections.is_none());
        assert!(event.detections().is_empty());
        assert!(event.image_info.presigned_url.is_none());
    }

    #[test]
    fn test_rejects_garbage_timestamp() {
        let json = r#"{
            "capture_timestamp_utc": "yesterday",
            "location": {"latitude": 1.0, "longitude": 2.0},
            "image_info": {"uuid": "550e8400-e29b-41d4-a716-446655440000"}
        }"#;

        assert!(serde_json::from_str::<CaptureEvent>(json).is_err());
    }
}
