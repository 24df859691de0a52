//! Ingestion HTTP server.
//!
//! Three routes: `POST /clips` runs the four-stage pipeline for one clip,
//! `GET /health` reports readiness and credential presence, and `POST /log`
//! is a fire-and-forget diagnostics relay that always answers 204.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::config::ServerSettings;
use crate::domain::ClipUploadRequest;
use crate::pipeline::{
    FfmpegEncoder, FsObjectStore, HttpTranscriber, IngestError, IngestPipeline, MetadataIndex,
};

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<IngestPipeline>,
    collection: String,
    bucket: String,
    transcribe_credential: bool,
}

impl AppState {
    pub fn new(
        pipeline: Arc<IngestPipeline>,
        collection: impl Into<String>,
        bucket: impl Into<String>,
        transcribe_credential: bool,
    ) -> Self {
        Self {
            pipeline,
            collection: collection.into(),
            bucket: bucket.into(),
            transcribe_credential,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    ok: bool,
    collection: String,
    bucket: String,
    transcribe_credential: bool,
}

/// Build the ingestion router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/clips", post(ingest_clip))
        .route("/health", get(health))
        .route("/log", post(relay_log))
        .with_state(state)
}

async fn ingest_clip(
    State(state): State<AppState>,
    Json(request): Json<ClipUploadRequest>,
) -> Response {
    match state.pipeline.ingest(request).await {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(IngestError::InvalidPayload(detail)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: detail }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Clip ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        ok: true,
        collection: state.collection.clone(),
        bucket: state.bucket.clone(),
        transcribe_credential: state.transcribe_credential,
    })
}

/// Best-effort diagnostics sink. Accepts anything, never fails the caller.
async fn relay_log(body: axum::body::Bytes) -> StatusCode {
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(event) => tracing::debug!(event = %event, "Client diagnostics"),
        Err(_) => tracing::debug!(bytes = body.len(), "Client diagnostics (unparsed)"),
    }
    StatusCode::NO_CONTENT
}

/// Build production state from settings
pub fn build_state(settings: &ServerSettings, index_path: std::path::PathBuf) -> Result<AppState> {
    let transcriber = HttpTranscriber::new(settings)?;
    let transcribe_credential = transcriber.has_credential();

    let pipeline = Arc::new(IngestPipeline::new(
        Arc::new(FfmpegEncoder::new(settings)),
        Arc::new(transcriber),
        Arc::new(FsObjectStore::new(settings)),
        Arc::new(MetadataIndex::open(index_path, &settings.collection)?),
    ));

    Ok(AppState::new(
        pipeline,
        settings.collection.clone(),
        settings.storage_bucket.clone(),
        transcribe_credential,
    ))
}

/// Bind and serve until the process exits
pub async fn serve(settings: &ServerSettings, index_path: std::path::PathBuf) -> Result<()> {
    let state = build_state(settings, index_path)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_address))?;

    tracing::info!(address = %settings.bind_address, "Ingestion server listening");
    axum::serve(listener, app)
        .await
        .context("Ingestion server failed")?;

    Ok(())
}
