use crate::config::AppConfig;
use crate::store::{SharedStore, StoreError};
use crate::types::{Measurement, NewMeasurement, ValidationError};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Error message of the 404 returned when there is nothing to delete.
pub const NOTHING_TO_DELETE: &str = "No measurements to delete";

pub struct AppState {
    pub store: SharedStore,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid payload: {0}")]
    Validation(#[from] ValidationError),
    #[error("Invalid payload: {0}")]
    MalformedBody(String),
    #[error("Measurement store unavailable")]
    Unavailable(#[source] StoreError),
    #[error("Measurement store operation failed")]
    Store(#[source] StoreError),
    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Unavailable(source) | ApiError::Store(source) => {
                error!("{}: {}", self, source);
                json!({ "error": self.to_string(), "details": source.to_string() })
            }
            _ => {
                warn!("{} {}", status.as_u16(), self);
                json!({ "error": self.to_string() })
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP surface: the measurement API under `/api`, JSON 404 for everything else.
pub fn router(store: SharedStore) -> Router {
    let state = Arc::new(AppState { store });

    let api = Router::new()
        .route("/health", get(health).fallback(not_found))
        .route(
            "/measurements",
            get(list_measurements)
                .post(create_measurement)
                .fallback(not_found),
        )
        .route("/measurements/latest", delete(delete_latest).fallback(not_found));

    Router::new()
        .nest("/api", api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: AppConfig, store: SharedStore) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Measurement API listening on http://{}/api", listener.local_addr()?);

    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn list_measurements(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    let records = state
        .store
        .list_newest_first()
        .await
        .map_err(ApiError::Unavailable)?;
    Ok(Json(records))
}

async fn create_measurement(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Measurement>), ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::MalformedBody(e.body_text()))?;
    let new = NewMeasurement::from_payload(&payload)?;
    let record = state.store.insert(new).await.map_err(ApiError::Store)?;
    info!(id = %record.id, kind = %record.kind, value = record.value, "Stored measurement");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_latest(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    match state.store.delete_latest().await.map_err(ApiError::Store)? {
        Some(removed) => {
            info!(id = %removed.id, "Deleted latest measurement");
            Ok(Json(json!({ "deletedCount": 1 })))
        }
        None => Err(ApiError::NotFound(NOTHING_TO_DELETE.to_string())),
    }
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}
