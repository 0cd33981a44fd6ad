//! Liveness probe: healthy iff the store answers and the speaker model is
//! loaded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{correlation, reply_with_correlation, with_service};
use crate::service::AuthService;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
    version: String,
}

pub async fn health_handler(
    correlation_id: String,
    service: Arc<AuthService>,
) -> Result<impl Reply, Rejection> {
    let store_ok = service.store_healthy().await;
    let model_ok = service.model_ready().await;
    let healthy = store_ok && model_ok;
    if !healthy {
        tracing::warn!("Health check degraded: store={}, model={}", store_ok, model_ok);
    }
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(reply_with_correlation(&body, status, &correlation_id))
}

pub fn routes(
    service: Arc<AuthService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .and(correlation())
        .and(with_service(service))
        .and_then(health_handler)
}
