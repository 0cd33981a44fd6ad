//! HTTP surface: request filters, rejection handling, and the response
//! envelope shared by every endpoint.

pub mod auth;
pub mod health;
pub mod webhook;

use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::audio::AudioError;
use crate::embedding::EmbeddingError;
use crate::fetch::FetchError;
use crate::capture::CaptureError;
use crate::service::{AuthService, EnrollmentError, VerificationError};

pub const CORRELATION_HEADER: &str = "x-call-id";
pub const DEFAULT_HISTORY_LIMIT: i64 = 10;

pub fn with_service(
    service: Arc<AuthService>,
) -> impl Filter<Extract = (Arc<AuthService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Pull the correlation id from the request, minting one when absent. The id
/// is echoed on every response.
pub fn correlation() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>(CORRELATION_HEADER)
        .map(|id: Option<String>| id.unwrap_or_else(|| Uuid::new_v4().to_string()))
}

/// At least ten digits once separators are stripped.
pub fn valid_phone(phone: &str) -> bool {
    phone.chars().filter(|c| c.is_ascii_digit()).count() >= 10
}

pub fn valid_http_url(url: &str) -> bool {
    matches!(Url::parse(url), Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https")
}

pub fn valid_ws_url(url: &str) -> bool {
    matches!(Url::parse(url), Ok(parsed) if parsed.scheme() == "ws" || parsed.scheme() == "wss")
}

/// Rejection carrying the public error taxonomy. Upstream detail stays in
/// the logs; responses only see the kind and a headline message.
#[derive(Debug)]
pub struct ApiError {
    pub kind: &'static str,
    pub status: StatusCode,
    pub message: String,
    pub correlation_id: String,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
    pub fn reject(self) -> Rejection {
        warp::reject::custom(self)
    }

    pub fn bad_request(kind: &'static str, message: &str, correlation_id: String) -> Self {
        Self {
            kind,
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
            correlation_id,
        }
    }

    pub fn from_enrollment(err: &EnrollmentError, correlation_id: String) -> Self {
        let (kind, status, message) = match err {
            EnrollmentError::Download(cause) => match cause {
                FetchError::Timeout => ("FetchTimeout", StatusCode::BAD_REQUEST, "timeout downloading audio"),
                FetchError::HttpStatus(_) => (
                    "FetchHTTPStatus",
                    StatusCode::BAD_REQUEST,
                    "audio download failed with an HTTP error",
                ),
                FetchError::EmptyDownload => (
                    "EmptyDownload",
                    StatusCode::BAD_REQUEST,
                    "downloaded audio file is empty",
                ),
                FetchError::Transport(_) => (
                    "FetchError",
                    StatusCode::BAD_REQUEST,
                    "failed to download audio",
                ),
            },
            EnrollmentError::Processing(cause) => audio_error_parts(cause),
            EnrollmentError::TooShort(_) => (
                "TooShort",
                StatusCode::UNPROCESSABLE_ENTITY,
                "audio too short for enrollment",
            ),
            EnrollmentError::Embedding(cause) => embedding_error_parts(cause),
            EnrollmentError::Store(_) => (
                "StoreError",
                StatusCode::INTERNAL_SERVER_ERROR,
                "database operation failed",
            ),
        };
        Self {
            kind,
            status,
            message: message.to_string(),
            correlation_id,
        }
    }

    pub fn from_verification(err: &VerificationError, correlation_id: String) -> Self {
        let (kind, status, message) = match err {
            VerificationError::Connection(CaptureError::ConnectionClosed) => (
                "ConnectionClosed",
                StatusCode::BAD_REQUEST,
                "audio stream closed during capture",
            ),
            VerificationError::Connection(_) => (
                "ConnectionError",
                StatusCode::BAD_REQUEST,
                "failed to connect to audio stream",
            ),
            VerificationError::Capture(CaptureError::NoAudioCaptured) => (
                "NoAudioCaptured",
                StatusCode::BAD_REQUEST,
                "no audio data captured",
            ),
            VerificationError::Capture(_) => (
                "ConnectionError",
                StatusCode::BAD_REQUEST,
                "audio capture failed",
            ),
            VerificationError::Comparison(_) => (
                "InternalError",
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            ),
            VerificationError::Store(_) => (
                "StoreError",
                StatusCode::INTERNAL_SERVER_ERROR,
                "database operation failed",
            ),
        };
        Self {
            kind,
            status,
            message: message.to_string(),
            correlation_id,
        }
    }

    pub fn store(correlation_id: String) -> Self {
        Self {
            kind: "StoreError",
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "database operation failed".to_string(),
            correlation_id,
        }
    }
}

fn audio_error_parts(err: &AudioError) -> (&'static str, StatusCode, &'static str) {
    match err {
        AudioError::TruncatedHeader => (
            "TruncatedHeader",
            StatusCode::UNPROCESSABLE_ENTITY,
            "audio data is truncated",
        ),
        AudioError::ValidationFailed(_) => (
            "ValidationFailed",
            StatusCode::UNPROCESSABLE_ENTITY,
            "audio failed validation",
        ),
        AudioError::EmptyInput | AudioError::UnsupportedOrCorrupt(_) => (
            "UnsupportedOrCorrupt",
            StatusCode::UNPROCESSABLE_ENTITY,
            "audio could not be decoded",
        ),
    }
}

fn embedding_error_parts(err: &EmbeddingError) -> (&'static str, StatusCode, &'static str) {
    match err {
        EmbeddingError::Unavailable(_) => (
            "EmbeddingUnavailable",
            StatusCode::SERVICE_UNAVAILABLE,
            "speaker model unavailable",
        ),
        EmbeddingError::Timeout => (
            "EmbeddingTimeout",
            StatusCode::SERVICE_UNAVAILABLE,
            "embedding inference timed out",
        ),
        EmbeddingError::WaveformTooShort(_) => (
            "TooShort",
            StatusCode::UNPROCESSABLE_ENTITY,
            "audio too short for embedding",
        ),
        EmbeddingError::Dimension(_) | EmbeddingError::Invalid => (
            "EmbeddingInvalid",
            StatusCode::UNPROCESSABLE_ENTITY,
            "voice embedding failed validation",
        ),
        EmbeddingError::Audio(cause) => audio_error_parts(cause),
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Attach the correlation header to a JSON reply.
pub fn reply_with_correlation<T: Serialize>(
    body: &T,
    status: StatusCode,
    correlation_id: &str,
) -> impl Reply {
    warp::reply::with_header(
        warp::reply::with_status(warp::reply::json(body), status),
        CORRELATION_HEADER,
        correlation_id.to_string(),
    )
}

pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (kind, status, message, correlation_id) = if let Some(err) = rejection.find::<ApiError>() {
        (
            err.kind.to_string(),
            err.status,
            err.message.clone(),
            err.correlation_id.clone(),
        )
    } else if rejection.is_not_found() {
        (
            "NotFound".to_string(),
            StatusCode::NOT_FOUND,
            "resource not found".to_string(),
            "unknown".to_string(),
        )
    } else if rejection
        .find::<warp::filters::body::BodyDeserializeError>()
        .is_some()
    {
        (
            "ValidationFailed".to_string(),
            StatusCode::BAD_REQUEST,
            "invalid request body".to_string(),
            "unknown".to_string(),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            "MethodNotAllowed".to_string(),
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
            "unknown".to_string(),
        )
    } else {
        tracing::error!("Unhandled rejection: {:?}", rejection);
        (
            "InternalError".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_string(),
            "unknown".to_string(),
        )
    };

    let body = ErrorResponse {
        error: kind,
        message,
        correlation_id: correlation_id.clone(),
        timestamp: Utc::now(),
    };
    Ok(reply_with_correlation(&body, status, &correlation_id))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_valid_phone() {
        assert!(valid_phone("+1 (555) 123-0000"));
        assert!(valid_phone("5551230000"));
        assert!(!valid_phone("555-1230"));
        assert!(!valid_phone(""));
    }

    #[test]
    fn test_url_validators() {
        assert!(valid_http_url("https://host/audio.wav"));
        assert!(valid_http_url("http://host/audio.wav"));
        assert!(!valid_http_url("ftp://host/audio.wav"));
        assert!(!valid_http_url("not a url"));
        assert!(valid_ws_url("wss://host/listen"));
        assert!(valid_ws_url("ws://host/listen"));
        assert!(!valid_ws_url("https://host/listen"));
    }

    #[test]
    fn test_enrollment_error_mapping() {
        let err = EnrollmentError::TooShort(2.0);
        let api = ApiError::from_enrollment(&err, "cid".into());
        assert_eq!(api.kind, "TooShort");
        assert_eq!(api.status, StatusCode::UNPROCESSABLE_ENTITY);

        let err = EnrollmentError::Download(FetchError::HttpStatus(404));
        let api = ApiError::from_enrollment(&err, "cid".into());
        assert_eq!(api.kind, "FetchHTTPStatus");
        assert_eq!(api.status, StatusCode::BAD_REQUEST);

        let err = EnrollmentError::Embedding(EmbeddingError::Timeout);
        let api = ApiError::from_enrollment(&err, "cid".into());
        assert_eq!(api.kind, "EmbeddingTimeout");
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_verification_error_mapping() {
        let err = VerificationError::Connection(CaptureError::Connection("refused".into()));
        let api = ApiError::from_verification(&err, "cid".into());
        assert_eq!(api.kind, "ConnectionError");
        assert_eq!(api.status, StatusCode::BAD_REQUEST);

        let err = VerificationError::Capture(CaptureError::NoAudioCaptured);
        let api = ApiError::from_verification(&err, "cid".into());
        assert_eq!(api.kind, "NoAudioCaptured");
    }
}
