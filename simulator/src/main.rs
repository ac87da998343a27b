mod bridge;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bridge::{envelope, token_grant, SimDevice};
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Fake smart-hub cloud API serving random sensor data.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Options {
    #[arg(long, env = "SIM_ADDR", default_value = "0.0.0.0:9000")]
    addr: String,

    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Fraction of resource requests answered with an error status
    #[arg(long, env = "FAILURE_RATE", default_value_t = 0.0)]
    failure_rate: f64,

    /// Statuses to pick from when failing a request
    #[arg(long, env = "FAILURE_STATUSES", value_delimiter = ',', default_value = "401,429,503")]
    failure_statuses: Vec<u16>,

    /// Lifetime of issued access tokens, in seconds
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 7 * 24 * 3600)]
    token_ttl_secs: i64,
}

struct SimState {
    devices: Vec<SimDevice>,
    failure_rate: f64,
    failure_statuses: Vec<StatusCode>,
    token_ttl_secs: i64,
    requests: AtomicU64,
}

impl SimState {
    fn injected_failure(&self) -> Option<StatusCode> {
        let mut rng = rand::thread_rng();
        if self.failure_statuses.is_empty() || !rng.gen_bool(self.failure_rate) {
            return None;
        }
        let idx = rng.gen_range(0..self.failure_statuses.len());
        Some(self.failure_statuses[idx])
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let options = Options::parse();

    let failure_statuses = options
        .failure_statuses
        .iter()
        .filter_map(|code| StatusCode::from_u16(*code).ok())
        .collect();
    let state = Arc::new(SimState {
        devices: (0..options.devices).map(SimDevice::new).collect(),
        failure_rate: options.failure_rate.clamp(0.0, 1.0),
        failure_statuses,
        token_ttl_secs: options.token_ttl_secs,
        requests: AtomicU64::new(0),
    });

    info!("Starting bridge simulator");
    info!(
        "Devices: {}, failure rate: {}, statuses: {:?}",
        options.devices, options.failure_rate, options.failure_statuses
    );

    let app = Router::new()
        .route("/route/clip/v2/resource/:resource", get(get_resource))
        .route("/v2/oauth2/token", post(issue_token))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&options.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", options.addr, e);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", options.addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}

async fn get_resource(State(state): State<Arc<SimState>>, Path(resource): Path<String>) -> Response {
    let count = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
    if count % 1000 == 0 {
        info!("Served {} requests", count);
    }

    if let Some(status) = state.injected_failure() {
        warn!("Failing {} request with {}", resource, status);
        return (status, status.canonical_reason().unwrap_or("error")).into_response();
    }

    let now = Utc::now();
    let mut rng = rand::thread_rng();
    let data = match resource.as_str() {
        "device" => state.devices.iter().map(|d| d.device_json()).collect(),
        "motion" => state
            .devices
            .iter()
            .map(|d| d.motion_json(&mut rng, now))
            .collect(),
        "temperature" => state
            .devices
            .iter()
            .map(|d| d.temperature_json(&mut rng, now))
            .collect(),
        "device_power" => state.devices.iter().map(|d| d.power_json(&mut rng)).collect(),
        _ => return (StatusCode::NOT_FOUND, "unknown resource").into_response(),
    };

    Json(envelope(data)).into_response()
}

async fn issue_token(State(state): State<Arc<SimState>>) -> Response {
    let mut rng = rand::thread_rng();
    info!("Issuing refreshed token");
    Json(token_grant(&mut rng, state.token_ttl_secs)).into_response()
}
