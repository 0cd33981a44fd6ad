//! Persistence for voiceprints and authentication attempts.
//!
//! The production binding lives in [`postgres`]; tests run against the
//! in-memory [`memory::MemoryStore`] behind the same trait.

mod memory;
mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::{establish_connection_pool, DbPool, PgStore};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Enrolled user voiceprint, keyed by phone number.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Voiceprint {
    pub phone: String,
    pub id: Uuid,
    pub embedding: Vec<f64>,
    pub enrolled_at: DateTime<Utc>,
}

/// One recorded verification outcome. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuthAttempt {
    pub id: i64,
    pub phone: String,
    pub success: bool,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewAuthAttempt {
    pub phone: String,
    pub success: bool,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait VoiceStore: Send + Sync {
    /// Insert or overwrite the voiceprint row for `user.phone`, returning the
    /// persisted record.
    async fn upsert_user(&self, user: Voiceprint) -> Result<Voiceprint, StoreError>;

    async fn get_user_by_phone(&self, phone: &str) -> Result<Option<Voiceprint>, StoreError>;

    /// Returns whether a row existed.
    async fn delete_user(&self, phone: &str) -> Result<bool, StoreError>;

    /// Append an attempt; the store assigns the id.
    async fn log_attempt(&self, attempt: NewAuthAttempt) -> Result<AuthAttempt, StoreError>;

    /// Most recent attempts first.
    async fn attempts_by_phone(&self, phone: &str, limit: i64) -> Result<Vec<AuthAttempt>, StoreError>;

    /// Failed attempts within the trailing window.
    async fn recent_failure_count(&self, phone: &str, window_minutes: i64) -> Result<i64, StoreError>;

    /// Liveness probe. Never errors.
    async fn health_check(&self) -> bool;
}

/// Retry an operation with exponential backoff. Only transient failures are
/// retried; query errors surface immediately.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    base_backoff: Duration,
    op: F,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = base_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    "Store operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    max_attempts,
                    backoff,
                    err
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unavailable("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_query_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Query("bad statement".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
