use crate::config::DatabaseConfig;
use crate::model::{CapturePoint, DamageStatus, ModelError};
use crate::region::RegionRecord;
use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Damage {0} not found")]
    DamageNotFound(i64),

    #[error("Category {0} missing after upsert")]
    CategoryMissing(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl StoreError {
    /// Failures that can succeed on a later attempt with the same input:
    /// lost connections, pool exhaustion, serialization failures and
    /// deadlocks. Data and integrity errors (SQLSTATE classes 22 and 23)
    /// fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    }
}

/// Connection exceptions (08), serialization failure, deadlock,
/// insufficient resources (53) and operator intervention (57P0x)
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01")
        || code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P0")
}

/// Result of persisting a capture point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A new capture point and its damages were written
    Created { capture_point_id: i64, damages: usize },
    /// A capture point for the same capture already exists; nothing was written
    Duplicate,
}

/// Storage seam for the capture aggregate
#[async_trait]
pub trait CaptureRepository: Send + Sync {
    /// Write a capture point with all of its damages as one unit.
    ///
    /// Keyed by `capture_uuid`: a second call for the same capture reports
    /// [`PersistOutcome::Duplicate`] and writes nothing.
    async fn persist(&self, capture: &CapturePoint) -> Result<PersistOutcome, StoreError>;

    /// Move a damage record forward in its repair lifecycle
    async fn update_damage_status(
        &self,
        damage_id: i64,
        next: DamageStatus,
    ) -> Result<DamageStatus, StoreError>;
}

/// Capture store over PostgreSQL with PostGIS
pub struct PgCaptureStore {
    pool: PgPool,
}

impl PgCaptureStore {
    /// Create a new store with connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// All regions, parents before children where ids allow
    pub async fn load_regions(&self) -> Result<Vec<RegionRecord>, StoreError> {
        let regions = sqlx::query_as::<_, RegionRecord>(
            r#"
            SELECT region_id, parent_id, name
            FROM region
            ORDER BY region_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        debug!(count = regions.len(), "Regions loaded");
        Ok(regions)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

#[async_trait]
impl CaptureRepository for PgCaptureStore {
    #[instrument(
        skip(self, capture),
        fields(capture_uuid = %capture.capture_uuid, public_id = %capture.public_id)
    )]
    async fn persist(&self, capture: &CapturePoint) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO capture_point (
                public_id, capture_uuid, capture_timestamp, location,
                accuracy_meters, image_url, risk, street_address, region_id
            ) VALUES (
                $1, $2, $3, ST_SetSRID(ST_MakePoint($4, $5), 4326)::geography,
                $6, $7, $8, $9, $10
            )
            ON CONFLICT (capture_uuid) DO NOTHING
            RETURNING capture_point_id
            "#,
        )
        .bind(capture.public_id)
        .bind(capture.capture_uuid)
        .bind(capture.captured_at)
        .bind(capture.location.longitude())
        .bind(capture.location.latitude())
        .bind(capture.accuracy_meters)
        .bind(&capture.image_url)
        .bind(capture.risk)
        .bind(&capture.street_address)
        .bind(capture.region_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(capture_point_id) = inserted else {
            tx.rollback().await?;
            debug!("Capture already stored");
            return Ok(PersistOutcome::Duplicate);
        };

        let category_ids = ensure_categories(&mut *tx, &capture.category_names()).await?;

        for damage in capture.damages() {
            let category_id = category_ids
                .get(damage.category_name.as_str())
                .copied()
                .ok_or_else(|| StoreError::CategoryMissing(damage.category_name.clone()))?;

            sqlx::query(
                r#"
                INSERT INTO capture_damage (
                    capture_point_id, category_id, status, description,
                    created_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, NOW(), NOW()
                )
                "#,
            )
            .bind(capture_point_id)
            .bind(category_id)
            .bind(damage.status.as_str())
            .bind(&damage.description)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            capture_point_id,
            damages = capture.damages().len(),
            "Capture point stored"
        );

        Ok(PersistOutcome::Created {
            capture_point_id,
            damages: capture.damages().len(),
        })
    }

    #[instrument(skip(self))]
    async fn update_damage_status(
        &self,
        damage_id: i64,
        next: DamageStatus,
    ) -> Result<DamageStatus, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM capture_damage WHERE damage_id = $1 FOR UPDATE",
        )
        .bind(damage_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current: DamageStatus = current
            .ok_or(StoreError::DamageNotFound(damage_id))?
            .parse()?;
        let next = current.advance(next)?;

        sqlx::query("UPDATE capture_damage SET status = $2, updated_at = NOW() WHERE damage_id = $1")
            .bind(damage_id)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }
}

/// Create missing categories and return the id of every name.
///
/// Names are inserted in sorted order with `DO NOTHING`, so existing rows are
/// never locked and concurrent writers wait on new rows in the same order.
async fn ensure_categories(
    conn: &mut PgConnection,
    names: &[&str],
) -> Result<HashMap<String, i32>, StoreError> {
    let mut sorted = names.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    for name in &sorted {
        sqlx::query(
            "INSERT INTO damage_category (category_name) VALUES ($1) ON CONFLICT (category_name) DO NOTHING",
        )
        .bind(*name)
        .execute(&mut *conn)
        .await?;
    }

    let rows: Vec<(i32, String)> = sqlx::query_as(
        "SELECT category_id, category_name FROM damage_category WHERE category_name = ANY($1)",
    )
    .bind(&sorted)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
}
