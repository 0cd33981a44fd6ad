//! Enrollment, verification, and audit-history endpoints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{
    correlation, reply_with_correlation, valid_http_url, valid_phone, valid_ws_url, with_service,
    ApiError, DEFAULT_HISTORY_LIMIT,
};
use crate::service::AuthService;
use crate::store::AuthAttempt;

#[derive(Deserialize)]
pub struct EnrollmentPayload {
    pub phone: String,
    #[serde(rename = "audioUrl")]
    pub audio_url: String,
}

#[derive(Serialize)]
struct EnrollmentResponse {
    status: String,
    score: f64,
}

#[derive(Deserialize)]
pub struct VerificationPayload {
    pub phone: String,
    #[serde(rename = "listenUrl")]
    pub listen_url: String,
}

#[derive(Serialize)]
struct VerificationResponse {
    success: bool,
    message: String,
    score: Option<f64>,
    records: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    phone: String,
    attempts: Vec<AuthAttempt>,
}

pub async fn enroll_handler(
    payload: EnrollmentPayload,
    correlation_id: String,
    service: Arc<AuthService>,
) -> Result<impl Reply, Rejection> {
    if !valid_phone(&payload.phone) {
        return Err(ApiError::bad_request(
            "InvalidPhoneNumber",
            "phone number must contain at least 10 digits",
            correlation_id,
        )
        .reject());
    }
    if !valid_http_url(&payload.audio_url) {
        return Err(ApiError::bad_request(
            "InvalidAudioURL",
            "audio URL must be a valid HTTP/HTTPS URL",
            correlation_id,
        )
        .reject());
    }

    match service.enroll_user(&payload.phone, &payload.audio_url).await {
        Ok((status, score)) => {
            let body = EnrollmentResponse {
                status: status.to_string(),
                score,
            };
            Ok(reply_with_correlation(&body, StatusCode::OK, &correlation_id))
        }
        Err(err) => {
            tracing::error!(
                "Enrollment failed for {} [{}]: {:#?}",
                payload.phone,
                correlation_id,
                err
            );
            Err(ApiError::from_enrollment(&err, correlation_id).reject())
        }
    }
}

pub async fn verify_handler(
    payload: VerificationPayload,
    correlation_id: String,
    service: Arc<AuthService>,
) -> Result<impl Reply, Rejection> {
    if !valid_phone(&payload.phone) {
        return Err(ApiError::bad_request(
            "InvalidPhoneNumber",
            "phone number must contain at least 10 digits",
            correlation_id,
        )
        .reject());
    }
    if !valid_ws_url(&payload.listen_url) {
        return Err(ApiError::bad_request(
            "InvalidListenURL",
            "listen URL must be a valid WebSocket URL (ws:// or wss://)",
            correlation_id,
        )
        .reject());
    }

    match service.verify_user(&payload.phone, &payload.listen_url).await {
        Ok(outcome) => {
            let body = VerificationResponse {
                success: outcome.success,
                message: outcome.message,
                score: outcome.score,
                records: None,
            };
            Ok(reply_with_correlation(&body, StatusCode::OK, &correlation_id))
        }
        Err(err) => {
            tracing::error!(
                "Verification failed for {} [{}]: {:#?}",
                payload.phone,
                correlation_id,
                err
            );
            Err(ApiError::from_verification(&err, correlation_id).reject())
        }
    }
}

pub async fn history_handler(
    phone: String,
    query: HistoryQuery,
    correlation_id: String,
    service: Arc<AuthService>,
) -> Result<impl Reply, Rejection> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 100);
    match service.auth_history(&phone, limit).await {
        Ok(attempts) => {
            let body = HistoryResponse { phone, attempts };
            Ok(reply_with_correlation(&body, StatusCode::OK, &correlation_id))
        }
        Err(err) => {
            tracing::error!("Failed to load auth history for {}: {}", phone, err);
            Err(ApiError::store(correlation_id).reject())
        }
    }
}

pub fn routes(
    service: Arc<AuthService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let api = warp::path("api").and(warp::path("v1"));

    let enroll = api
        .and(warp::path("enroll-user"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(correlation())
        .and(with_service(service.clone()))
        .and_then(enroll_handler);

    let verify = api
        .and(warp::path("verify-password"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(correlation())
        .and(with_service(service.clone()))
        .and_then(verify_handler);

    let history = api
        .and(warp::path("users"))
        .and(warp::path::param::<String>())
        .and(warp::path("auth-history"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(correlation())
        .and(with_service(service))
        .and_then(history_handler);

    enroll.or(verify).or(history)
}
