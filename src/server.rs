//! HTTP server.
//!
//! Thin routing layer over [`Forecaster`]. Every handler delegates to the
//! service and maps its result onto the JSON contract below.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/sales` | Current cache snapshot, in source order |
//! | `POST` | `/api/upload` | Multipart `file` field; replaces the dataset and retrains |
//! | `GET`  | `/api/metadata` | Metadata document of the trained model |
//! | `POST` | `/api/predict` | JSON object with one input row |
//! | `GET`  | `/api/status` | Active dataset, row counts, training state |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Errors are `{ "error": "...", "details": "..." }`, with `details` present
//! when an external process produced output worth showing:
//!
//! - `400` malformed request (no file, bad name, non-object JSON)
//! - `404` no trained model yet (`/api/metadata`)
//! - `409` a training run is already in progress
//! - `500` training or inference process failure
//!
//! A prediction the scorer itself refused (unknown model, bad input) is
//! **not** an HTTP error: it is `200 { "error": "..." }`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a separately served
//! dashboard can call the API.

use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::TableSnapshot;
use crate::config::Config;
use crate::inference::PredictOutcome;
use crate::service::{Forecaster, ServiceError, ServiceStatus};
use crate::training::TrainingError;

/// Name of the multipart field carrying the dataset.
const UPLOAD_FIELD: &str = "file";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    forecaster: Arc<Forecaster>,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Loads any dataset left in the artifact store before accepting requests,
/// and runs until the process receives Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let forecaster = Arc::new(Forecaster::open(config).await?);
    let app = build_router(forecaster, config.server.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Forecast server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Builds the router around an existing service.
pub fn build_router(forecaster: Arc<Forecaster>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/sales", get(handle_sales))
        .route("/api/upload", post(handle_upload))
        .route("/api/metadata", get(handle_metadata))
        .route("/api/predict", post(handle_predict))
        .route("/api/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(AppState { forecaster })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    error: String,
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        error: message.into(),
        details: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        error: message.into(),
        details: None,
    }
}

fn internal(message: impl Into<String>, details: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        error: message.into(),
        details: Some(details.into()),
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::BadRequest(message) => bad_request(message),
            ServiceError::Busy => AppError {
                status: StatusCode::CONFLICT,
                error: "A training run is already in progress".to_string(),
                details: None,
            },
            ServiceError::Storage(e) => internal("Failed to store dataset", format!("{:#}", e)),
            ServiceError::Training(e) => {
                let details = e.output().map(str::to_string).unwrap_or_else(|| e.to_string());
                let message = match e {
                    TrainingError::Launch(_) | TrainingError::Wait(_) => {
                        "Failed to run training job".to_string()
                    }
                    TrainingError::Failed { .. } => "Training failed".to_string(),
                    TrainingError::TimedOut { after_secs, .. } => {
                        format!("Training timed out after {}s", after_secs)
                    }
                };
                internal(message, details)
            }
            ServiceError::Reload(e) => internal(
                "Training succeeded but the dataset could not be reloaded",
                format!("{:#}", e),
            ),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/sales ============

/// Serializes a snapshot's rows without copying them out of the `Arc`.
struct RowsBody(Arc<TableSnapshot>);

impl Serialize for RowsBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.rows.serialize(serializer)
    }
}

async fn handle_sales(State(state): State<AppState>) -> Json<RowsBody> {
    Json(RowsBody(state.forecaster.snapshot().await))
}

// ============ POST /api/upload ============

/// Handler for `POST /api/upload`.
///
/// Reads the first `file` field, then saves, cleans up, trains and reloads
/// synchronously. Responds only once the cache reflects the new dataset.
async fn handle_upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, AppError> {
    let mut multipart = multipart.map_err(|_| bad_request("No file uploaded"))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Malformed upload: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| state.forecaster.store().layout().default_dataset.clone());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("Malformed upload: {}", e)))?;
        upload = Some((file_name, bytes));
        break;
    }

    let (file_name, bytes) = upload.ok_or_else(|| bad_request("No file uploaded"))?;
    let receipt = state.forecaster.upload(&file_name, &bytes).await?;

    Ok(Json(json!({
        "message": "Model retrained successfully",
        "output": receipt.training.output,
        "dataset": receipt.training.dataset,
        "sha256": receipt.sha256,
        "run_id": receipt.training.run_id.to_string(),
        "rows_loaded": receipt.training.rows_loaded,
        "rows_dropped": receipt.training.rows_dropped,
        "elapsed_ms": receipt.training.elapsed.as_millis() as u64,
        "removed_artifacts": receipt.cleanup.removed,
    })))
}

// ============ GET /api/metadata ============

async fn handle_metadata(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    match state.forecaster.metadata() {
        Ok(Some(doc)) => Ok(Json(doc)),
        Ok(None) => Err(not_found("Model metadata not found. Upload a dataset to train a model.")),
        Err(e) => Err(internal("Failed to read model metadata", format!("{:#}", e))),
    }
}

// ============ POST /api/predict ============

#[derive(Serialize)]
struct PredictionBody {
    prediction: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fallback_encoded: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filled_missing: Vec<String>,
}

/// Handler for `POST /api/predict`.
///
/// `200 {prediction}` on success, `200 {error}` when the request was refused
/// on its merits, `500 {error, details}` when the scorer itself misbehaved.
async fn handle_predict(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body.map_err(|e| bad_request(format!("Invalid JSON body: {}", e.body_text())))?;
    let Value::Object(row) = body else {
        return Err(bad_request("Prediction input must be a JSON object"));
    };

    match state.forecaster.predict(&row).await {
        Ok(PredictOutcome::Prediction {
            value,
            fallback_encoded,
            filled_missing,
        }) => Ok(Json(PredictionBody {
            prediction: value,
            fallback_encoded,
            filled_missing,
        })
        .into_response()),
        Ok(PredictOutcome::Rejected(message)) => {
            Ok(Json(json!({ "error": message })).into_response())
        }
        Err(e) => Err(internal(format!("Prediction failed: {}", e), e.details())),
    }
}

// ============ GET /api/status ============

async fn handle_status(State(state): State<AppState>) -> Json<ServiceStatus> {
    Json(state.forecaster.status().await)
}
