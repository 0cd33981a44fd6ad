//! Telephony-provider webhook: verification driven by a call envelope.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::{correlation, reply_with_correlation, with_service, ApiError};
use crate::service::AuthService;

#[derive(Deserialize, Default)]
pub struct WebhookPayload {
    message: Option<WebhookMessage>,
}

#[derive(Deserialize, Default)]
struct WebhookMessage {
    call: Option<WebhookCall>,
    customer: Option<Customer>,
}

#[derive(Deserialize, Default)]
struct WebhookCall {
    customer: Option<Customer>,
    monitor: Option<Monitor>,
}

#[derive(Deserialize, Default)]
struct Customer {
    number: Option<String>,
}

#[derive(Deserialize, Default)]
struct Monitor {
    #[serde(rename = "listenUrl")]
    listen_url: Option<String>,
}

/// Caller number from the envelope; the customer object may hang off the
/// call or sit directly under the message.
pub fn extract_phone(payload: &WebhookPayload) -> Option<String> {
    let message = payload.message.as_ref()?;
    if let Some(number) = message
        .call
        .as_ref()
        .and_then(|call| call.customer.as_ref())
        .and_then(|customer| customer.number.clone())
    {
        return Some(number);
    }
    message
        .customer
        .as_ref()
        .and_then(|customer| customer.number.clone())
}

pub fn extract_listen_url(payload: &WebhookPayload) -> Option<String> {
    payload
        .message
        .as_ref()?
        .call
        .as_ref()?
        .monitor
        .as_ref()?
        .listen_url
        .clone()
}

#[derive(Serialize)]
struct WebhookResponse {
    success: bool,
    message: String,
    score: Option<f64>,
    phone: String,
    correlation_id: String,
    timestamp: chrono::DateTime<Utc>,
}

pub async fn webhook_handler(
    payload: WebhookPayload,
    correlation_id: String,
    service: Arc<AuthService>,
) -> Result<impl Reply, Rejection> {
    let Some(phone) = extract_phone(&payload) else {
        tracing::error!("Webhook without caller number [{}]", correlation_id);
        return Err(ApiError::bad_request(
            "MissingPhoneNumber",
            "could not extract phone number from call data",
            correlation_id,
        )
        .reject());
    };
    let Some(listen_url) = extract_listen_url(&payload) else {
        tracing::error!("Webhook without listen URL [{}]", correlation_id);
        return Err(ApiError::bad_request(
            "MissingListenURL",
            "could not extract WebSocket listen URL from call data",
            correlation_id,
        )
        .reject());
    };

    tracing::info!(
        "Processing webhook verification for {} [{}]",
        phone,
        correlation_id
    );
    match service.verify_user(&phone, &listen_url).await {
        Ok(outcome) => {
            let body = WebhookResponse {
                success: outcome.success,
                message: outcome.message,
                score: outcome.score,
                phone,
                correlation_id: correlation_id.clone(),
                timestamp: Utc::now(),
            };
            Ok(reply_with_correlation(&body, StatusCode::OK, &correlation_id))
        }
        Err(err) => {
            tracing::error!(
                "Webhook verification failed for {} [{}]: {:#?}",
                phone,
                correlation_id,
                err
            );
            Err(ApiError::from_verification(&err, correlation_id).reject())
        }
    }
}

pub fn routes(
    service: Arc<AuthService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("api")
        .and(warp::path("v1"))
        .and(warp::path("vapi-webhook"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(correlation())
        .and(with_service(service))
        .and_then(webhook_handler)
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope(json: &str) -> WebhookPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_extract_phone_from_call_customer() {
        let payload = envelope(
            r#"{"message": {"call": {"customer": {"number": "+15551230000"},
                "monitor": {"listenUrl": "wss://bridge/listen"}}}}"#,
        );
        assert_eq!(extract_phone(&payload).as_deref(), Some("+15551230000"));
        assert_eq!(
            extract_listen_url(&payload).as_deref(),
            Some("wss://bridge/listen")
        );
    }

    #[test]
    fn test_extract_phone_fallback_path() {
        let payload = envelope(r#"{"message": {"customer": {"number": "+15559990000"}}}"#);
        assert_eq!(extract_phone(&payload).as_deref(), Some("+15559990000"));
        assert_eq!(extract_listen_url(&payload), None);
    }

    #[test]
    fn test_extract_missing_fields() {
        let payload = envelope(r#"{"message": {"call": {}}}"#);
        assert_eq!(extract_phone(&payload), None);
        assert_eq!(extract_listen_url(&payload), None);
        let payload = envelope("{}");
        assert_eq!(extract_phone(&payload), None);
    }
}
