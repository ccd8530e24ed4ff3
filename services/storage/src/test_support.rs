use crate::capture_store::{CaptureRepository, PersistOutcome, StoreError};
use crate::model::{CapturePoint, DamageStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::error::{DatabaseError, ErrorKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// Database error carrying only a SQLSTATE, as Postgres would report it
#[derive(Debug)]
pub struct SqlState(pub &'static str);

impl SqlState {
    pub fn into_store_error(self) -> StoreError {
        StoreError::Database(sqlx::Error::Database(Box::new(self)))
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQLSTATE {}", self.0)
    }
}

impl std::error::Error for SqlState {}

impl DatabaseError for SqlState {
    fn message(&self) -> &str {
        self.0
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self.0))
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> ErrorKind {
        match self.0 {
            "23505" => ErrorKind::UniqueViolation,
            "23503" => ErrorKind::ForeignKeyViolation,
            "23502" => ErrorKind::NotNullViolation,
            "23514" => ErrorKind::CheckViolation,
            _ => ErrorKind::Other,
        }
    }
}

type Failure = Box<dyn Fn() -> StoreError + Send + Sync>;

#[derive(Default)]
struct Tables {
    categories: HashMap<String, i32>,
    points: Vec<CapturePoint>,
    /// (capture_point_id, category_id, status)
    damages: Vec<(i64, i32, DamageStatus)>,
}

/// Capture repository held in memory, with the same keying as the Postgres store
#[derive(Default)]
pub struct InMemoryCaptureStore {
    tables: Mutex<Tables>,
    failure: Option<Failure>,
}

impl InMemoryCaptureStore {
    /// Every persist fails with a pool timeout
    pub fn failing() -> Self {
        Self::failing_with(|| StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    pub fn failing_with(failure: impl Fn() -> StoreError + Send + Sync + 'static) -> Self {
        Self {
            tables: Mutex::default(),
            failure: Some(Box::new(failure)),
        }
    }

    pub fn points(&self) -> Vec<CapturePoint> {
        self.tables.lock().points.clone()
    }

    pub fn category_count(&self) -> usize {
        self.tables.lock().categories.len()
    }

    pub fn damage_count(&self) -> usize {
        self.tables.lock().damages.len()
    }
}

#[async_trait]
impl CaptureRepository for InMemoryCaptureStore {
    async fn persist(&self, capture: &CapturePoint) -> Result<PersistOutcome, StoreError> {
        if let Some(failure) = &self.failure {
            return Err(failure());
        }

        let mut tables = self.tables.lock();
        if tables
            .points
            .iter()
            .any(|p| p.capture_uuid == capture.capture_uuid)
        {
            return Ok(PersistOutcome::Duplicate);
        }

        tables.points.push(capture.clone());
        let capture_point_id = tables.points.len() as i64;

        for damage in capture.damages() {
            let next_id = tables.categories.len() as i32 + 1;
            let category_id = *tables
                .categories
                .entry(damage.category_name.clone())
                .or_insert(next_id);
            tables
                .damages
                .push((capture_point_id, category_id, damage.status));
        }

        Ok(PersistOutcome::Created {
            capture_point_id,
            damages: capture.damages().len(),
        })
    }

    async fn update_damage_status(
        &self,
        damage_id: i64,
        next: DamageStatus,
    ) -> Result<DamageStatus, StoreError> {
        let mut tables = self.tables.lock();
        let slot = usize::try_from(damage_id - 1)
            .ok()
            .and_then(|i| tables.damages.get_mut(i))
            .ok_or(StoreError::DamageNotFound(damage_id))?;
        slot.2 = slot.2.advance(next)?;
        Ok(slot.2)
    }
}
