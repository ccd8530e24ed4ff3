use crate::intake::{Coordinates, IntakeError, UploadIntake};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

/// Room left in the request body limit for the coordinate parts and multipart framing
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

impl From<MultipartError> for IntakeError {
    fn from(e: MultipartError) -> Self {
        IntakeError::Transfer {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Create the upload router
pub fn create_router(intake: Arc<UploadIntake>, max_upload_bytes: u64) -> Router {
    let body_limit = usize::try_from(max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES))
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/upload", post(upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(intake)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// POST /api/upload
///
/// Multipart form with an `image` part and string `latitude`/`longitude`
/// parts. Replies `uploaded: <uuid>` once the image is on disk and the raw
/// capture event is published.
async fn upload(
    State(intake): State<Arc<UploadIntake>>,
    mut multipart: Multipart,
) -> Result<String, IntakeError> {
    let id = Uuid::new_v4();

    match receive(&intake, id, &mut multipart).await {
        Ok(()) => Ok(format!("uploaded: {id}")),
        Err(e) => {
            intake.abandon(id, &e).await;
            Err(e)
        }
    }
}

async fn receive(intake: &UploadIntake, id: Uuid, multipart: &mut Multipart) -> Result<(), IntakeError> {
    let mut image = None;
    let mut latitude: Option<String> = None;
    let mut longitude: Option<String> = None;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                if image.is_some() {
                    return Err(IntakeError::DuplicatePart("image"));
                }
                let mut writer = intake.open_image(id).await?;
                while let Some(chunk) = field.chunk().await? {
                    writer.write_chunk(&chunk).await?;
                }
                image = Some(writer.finish().await?);
            }
            "latitude" => set_once(&mut latitude, "latitude", field.text().await?)?,
            "longitude" => set_once(&mut longitude, "longitude", field.text().await?)?,
            other => debug!(part = other, "Ignoring unknown form part"),
        }
    }

    let image = image.ok_or(IntakeError::MissingPart("image"))?;
    let coordinates = Coordinates::parse(latitude.as_deref(), longitude.as_deref())?;

    intake.emit(image, coordinates).await?;
    Ok(())
}

fn set_once(slot: &mut Option<String>, part: &'static str, value: String) -> Result<(), IntakeError> {
    if slot.is_some() {
        return Err(IntakeError::DuplicatePart(part));
    }
    *slot = Some(value);
    Ok(())
}

/// Serve the upload API until `shutdown` resolves
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
