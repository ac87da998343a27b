use crate::errors::Error;
use crate::health::HealthEvaluator;
use crate::model::{Hub, HubStatus, Reading};
use crate::store::Store;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    health: HealthEvaluator,
}

#[derive(Debug, Serialize)]
pub struct HubView {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub name: String,
    pub status: HubStatus,
    pub consecutive_failures: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub token_expires_at: DateTime<Utc>,
    pub healthy: bool,
    pub needs_attention: bool,
}

impl HubView {
    fn new(hub: Hub, health: &HealthEvaluator, now: DateTime<Utc>) -> Self {
        Self {
            healthy: health.is_healthy(hub.consecutive_failures),
            needs_attention: health.needs_attention(
                hub.last_success_at,
                hub.consecutive_failures,
                now,
            ),
            id: hub.id,
            customer_id: hub.customer_id,
            name: hub.name,
            status: hub.status,
            consecutive_failures: hub.consecutive_failures,
            last_polled_at: hub.last_polled_at,
            last_success_at: hub.last_success_at,
            token_expires_at: hub.token_expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HubsResponse {
    pub data: Vec<HubView>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    device_id: Uuid,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<Reading>,
    pub total: usize,
    pub limit: usize,
}

pub fn create_router(store: Arc<dyn Store>, health: HealthEvaluator) -> Router {
    let state = AppState { store, health };

    Router::new()
        .route("/api/v1/hubs", get(list_hubs))
        .route("/api/v1/readings", get(get_readings))
        .with_state(state)
}

async fn list_hubs(State(state): State<AppState>) -> Result<Json<HubsResponse>, AppError> {
    let now = Utc::now();
    let hubs = state.store.all_hubs().await?;
    let data: Vec<HubView> = hubs
        .into_iter()
        .map(|hub| HubView::new(hub, &state.health, now))
        .collect();

    Ok(Json(HubsResponse {
        total: data.len(),
        data,
    }))
}

/// Readings for one device, newest first. Defaults to the last 24 hours.
async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(24));
    if start > end {
        return Err(AppError::BadRequest("start must not be after end".to_string()));
    }

    let data = state
        .store
        .readings_for_devices(&[params.device_id], start, end, Some(limit))
        .await?;

    Ok(Json(ReadingsResponse {
        total: data.len(),
        data,
        limit,
    }))
}

enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            AppError::Internal(err) => {
                error!("API error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", err),
                )
                    .into_response()
            }
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(message) => AppError::BadRequest(message),
            other => AppError::Internal(other.into()),
        }
    }
}
