//! Capture aggregate: a capture point owning its damage records.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::region::RegionId;

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("{field} {value} is outside [{min}, {max}]")]
    CoordinateOutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Unknown damage status: {0}")]
    UnknownStatus(String),

    #[error("Damage status cannot move from {from} back to {to}")]
    Backwards { from: DamageStatus, to: DamageStatus },
}

/// Repair progress of a damage record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DamageStatus {
    #[default]
    Reported,
    Received,
    InProgress,
    Completed,
}

impl DamageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DamageStatus::Reported => "REPORTED",
            DamageStatus::Received => "RECEIVED",
            DamageStatus::InProgress => "IN_PROGRESS",
            DamageStatus::Completed => "COMPLETED",
        }
    }

    /// Move to `next`. Staying put is allowed; going back is not.
    pub fn advance(self, next: DamageStatus) -> Result<DamageStatus, ModelError> {
        if next < self {
            return Err(ModelError::Backwards {
                from: self,
                to: next,
            });
        }
        Ok(next)
    }
}

impl fmt::Display for DamageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DamageStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REPORTED" => Ok(DamageStatus::Reported),
            "RECEIVED" => Ok(DamageStatus::Received),
            "IN_PROGRESS" => Ok(DamageStatus::InProgress),
            "COMPLETED" => Ok(DamageStatus::Completed),
            _ => Err(ModelError::UnknownStatus(s.to_string())),
        }
    }
}

/// WGS84 point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    longitude: f64,
    latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Result<Self, ModelError> {
        check_axis("longitude", longitude, 180.0)?;
        check_axis("latitude", latitude, 90.0)?;
        Ok(Self {
            longitude,
            latitude,
        })
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }
}

fn check_axis(field: &'static str, value: f64, bound: f64) -> Result<(), ModelError> {
    if value.is_finite() && (-bound..=bound).contains(&value) {
        Ok(())
    } else {
        Err(ModelError::CoordinateOutOfRange {
            field,
            value,
            min: -bound,
            max: bound,
        })
    }
}

/// One damage found on a capture
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureDamage {
    capture_point: Uuid,
    pub category_name: String,
    pub status: DamageStatus,
    pub description: Option<String>,
}

impl CaptureDamage {
    /// Public identifier of the owning capture point
    pub fn capture_point(&self) -> Uuid {
        self.capture_point
    }
}

/// Persisted record of one captured image and location
#[derive(Debug, Clone, PartialEq)]
pub struct CapturePoint {
    /// Externally shareable identifier, generated once per capture point
    pub public_id: Uuid,
    /// Image identifier of the originating capture event
    pub capture_uuid: Uuid,
    pub captured_at: DateTime<Utc>,
    pub location: GeoPoint,
    pub accuracy_meters: Option<f64>,
    pub image_url: String,
    pub risk: Option<f64>,
    pub street_address: String,
    pub region_id: RegionId,
    damages: Vec<CaptureDamage>,
}

impl CapturePoint {
    pub fn new(
        capture_uuid: Uuid,
        captured_at: DateTime<Utc>,
        location: GeoPoint,
        street_address: impl Into<String>,
        region_id: RegionId,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            public_id: Uuid::new_v4(),
            capture_uuid,
            captured_at,
            location,
            accuracy_meters: None,
            image_url: image_url.into(),
            risk: None,
            street_address: street_address.into(),
            region_id,
            damages: Vec::new(),
        }
    }

    pub fn with_accuracy(mut self, accuracy_meters: Option<f64>) -> Self {
        self.accuracy_meters = accuracy_meters;
        self
    }

    pub fn with_risk(mut self, risk: Option<f64>) -> Self {
        self.risk = risk;
        self
    }

    /// Attach a new damage record in `Reported` state
    pub fn add_damage(
        &mut self,
        category_name: impl Into<String>,
        description: Option<String>,
    ) -> &CaptureDamage {
        self.damages.push(CaptureDamage {
            capture_point: self.public_id,
            category_name: category_name.into(),
            status: DamageStatus::Reported,
            description,
        });
        &self.damages[self.damages.len() - 1]
    }

    /// Damages in insertion order
    pub fn damages(&self) -> &[CaptureDamage] {
        &self.damages
    }

    /// Distinct category names, first occurrence order
    pub fn category_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for damage in &self.damages {
            if !names.contains(&damage.category_name.as_str()) {
                names.push(&damage.category_name);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> CapturePoint {
        CapturePoint::new(
            Uuid::new_v4(),
            Utc::now(),
            GeoPoint::new(127.38, 36.35).unwrap(),
            "Daejeon Yuseong-gu Deokjin-dong 123",
            10,
            "abc.jpg",
        )
    }

    #[test]
    fn test_damages_link_back_to_owner() {
        let mut capture = point();
        capture.add_damage("pothole", None);
        capture.add_damage("crack", Some("lane 2".to_string()));

        assert_eq!(capture.damages().len(), 2);
        for damage in capture.damages() {
            assert_eq!(damage.capture_point(), capture.public_id);
            assert_eq!(damage.status, DamageStatus::Reported);
        }
    }

    #[test]
    fn test_public_ids_are_fresh() {
        assert_ne!(point().public_id, point().public_id);
    }

    #[test]
    fn test_category_names_are_distinct() {
        let mut capture = point();
        capture.add_damage("pothole", None);
        capture.add_damage("crack", None);
        capture.add_damage("pothole", None);
        assert_eq!(capture.category_names(), vec!["pothole", "crack"]);
    }

    #[test]
    fn test_status_moves_forward_only() {
        let status = DamageStatus::Reported;
        let status = status.advance(DamageStatus::InProgress).unwrap();
        assert_eq!(status.advance(DamageStatus::InProgress), Ok(DamageStatus::InProgress));
        assert_eq!(
            status.advance(DamageStatus::Received),
            Err(ModelError::Backwards {
                from: DamageStatus::InProgress,
                to: DamageStatus::Received
            })
        );
        assert_eq!(status.advance(DamageStatus::Completed), Ok(DamageStatus::Completed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<DamageStatus>(), Ok(DamageStatus::InProgress));
        assert_eq!(DamageStatus::Completed.to_string(), "COMPLETED");
        assert!("FIXED".parse::<DamageStatus>().is_err());
    }

    #[test]
    fn test_geo_point_bounds() {
        assert!(GeoPoint::new(180.0, -90.0).is_ok());
        assert!(GeoPoint::new(180.1, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::NAN).is_err());
    }
}
