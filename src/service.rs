//! Enrollment and verification orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::audio::{self, AudioError};
use crate::capture::{CaptureConfig, CaptureError, LiveAudioSource};
use crate::embedding::{EmbeddingError, EmbeddingExtractor};
use crate::fetch::{BlobFetcher, FetchError};
use crate::similarity::{self, SimilarityError};
use crate::store::{
    with_retry, NewAuthAttempt, AuthAttempt, StoreError, VoiceStore, Voiceprint, RETRY_ATTEMPTS,
    RETRY_BASE_BACKOFF,
};

/// Shortest usable enrollment recording.
pub const MIN_ENROLL_SECONDS: f64 = 3.0;
/// Shortest usable live capture for verification.
pub const MIN_VERIFY_SECONDS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("failed to download audio: {0}")]
    Download(#[source] FetchError),
    #[error("failed to process audio: {0}")]
    Processing(#[source] AudioError),
    #[error("audio too short for enrollment: {0:.1}s (minimum {MIN_ENROLL_SECONDS}s required)")]
    TooShort(f64),
    #[error("failed to generate voice embedding: {0}")]
    Embedding(#[source] EmbeddingError),
    #[error("failed to store user enrollment: {0}")]
    Store(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("failed to connect to audio stream: {0}")]
    Connection(#[source] CaptureError),
    #[error("failed to capture audio: {0}")]
    Capture(#[source] CaptureError),
    #[error("failed to compare voice samples: {0}")]
    Comparison(#[source] SimilarityError),
    #[error("failed to retrieve user data: {0}")]
    Store(#[source] StoreError),
}

/// Outcome of a verification call. "Not enrolled" and a below-threshold
/// score are legitimate outcomes, not errors.
#[derive(Clone, Debug)]
pub struct VerifyOutcome {
    pub success: bool,
    pub message: String,
    pub score: Option<f64>,
}

pub struct AuthService {
    store: Arc<dyn VoiceStore>,
    fetcher: Arc<dyn BlobFetcher>,
    capture: Arc<dyn LiveAudioSource>,
    extractor: Arc<EmbeddingExtractor>,
    capture_config: CaptureConfig,
    threshold: f64,
    retry_backoff: Duration,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn VoiceStore>,
        fetcher: Arc<dyn BlobFetcher>,
        capture: Arc<dyn LiveAudioSource>,
        extractor: Arc<EmbeddingExtractor>,
        capture_config: CaptureConfig,
        threshold: f64,
    ) -> Self {
        Self {
            store,
            fetcher,
            capture,
            extractor,
            capture_config,
            threshold,
            retry_backoff: RETRY_BASE_BACKOFF,
        }
    }

    /// Shrink the retry backoff, for tests that exercise store outages.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Enroll a user: download the recording, normalize it, embed it, and
    /// upsert the voiceprint. A repeat enrollment replaces the stored print.
    pub async fn enroll_user(
        &self,
        phone: &str,
        audio_url: &str,
    ) -> Result<(&'static str, f64), EnrollmentError> {
        tracing::info!("Starting enrollment for {}", phone);

        let bytes = self
            .fetcher
            .fetch(audio_url)
            .await
            .map_err(EnrollmentError::Download)?;

        let wav = tokio::task::spawn_blocking(move || audio::normalize(&bytes, None))
            .await
            .map_err(|err| {
                EnrollmentError::Processing(AudioError::UnsupportedOrCorrupt(err.to_string()))
            })?
            .map_err(EnrollmentError::Processing)?;

        let duration = audio::duration_seconds(&wav).map_err(EnrollmentError::Processing)?;
        if duration < MIN_ENROLL_SECONDS {
            return Err(EnrollmentError::TooShort(duration));
        }
        tracing::info!("Enrollment audio: {} bytes, {:.1}s", wav.len(), duration);

        let embedding = self
            .extractor
            .extract(&wav)
            .await
            .map_err(EnrollmentError::Embedding)?;

        let user = Voiceprint {
            phone: phone.to_string(),
            id: Uuid::new_v4(),
            embedding,
            enrolled_at: Utc::now(),
        };
        let stored = with_retry(RETRY_ATTEMPTS, self.retry_backoff, || {
            self.store.upsert_user(user.clone())
        })
        .await
        .map_err(EnrollmentError::Store)?;

        tracing::info!("Enrollment completed for {} (record {})", phone, stored.id);
        Ok(("enrolled", 1.0))
    }

    /// Verify a caller against the enrolled voiceprint for `phone`.
    ///
    /// Exactly one attempt row is appended for every path that reaches a
    /// decision, including "not enrolled" and capture failures. Attempt
    /// logging itself is best-effort and never changes the outcome.
    pub async fn verify_user(
        &self,
        phone: &str,
        listen_url: &str,
    ) -> Result<VerifyOutcome, VerificationError> {
        tracing::info!("Starting verification for {}", phone);

        let user = with_retry(RETRY_ATTEMPTS, self.retry_backoff, || {
            self.store.get_user_by_phone(phone)
        })
        .await
        .map_err(VerificationError::Store)?;
        let Some(user) = user else {
            tracing::warn!("Verification for unenrolled phone {}", phone);
            self.log_attempt(phone, false, 0.0).await;
            return Ok(VerifyOutcome {
                success: false,
                message: "not enrolled".to_string(),
                score: None,
            });
        };

        let wav = match self.capture.capture(listen_url, &self.capture_config).await {
            Ok(wav) => wav,
            Err(err @ (CaptureError::BadUrl(_) | CaptureError::Connection(_) | CaptureError::ConnectionClosed)) => {
                tracing::error!("Audio stream connection failed for {}: {}", phone, err);
                self.log_attempt(phone, false, 0.0).await;
                return Err(VerificationError::Connection(err));
            }
            Err(err) => {
                tracing::error!("Audio capture failed for {}: {}", phone, err);
                self.log_attempt(phone, false, 0.0).await;
                return Err(VerificationError::Capture(err));
            }
        };

        let duration = audio::duration_seconds(&wav).unwrap_or(0.0);
        if duration < MIN_VERIFY_SECONDS {
            tracing::warn!("Captured audio too short: {:.1}s", duration);
            self.log_attempt(phone, false, 0.0).await;
            return Ok(VerifyOutcome {
                success: false,
                message: "audio too short".to_string(),
                score: None,
            });
        }

        let live = match self.extractor.extract(&wav).await {
            Ok(live) => live,
            Err(err) => {
                tracing::error!("Live embedding failed for {}: {}", phone, err);
                self.log_attempt(phone, false, 0.0).await;
                return Ok(VerifyOutcome {
                    success: false,
                    message: "processing failed".to_string(),
                    score: None,
                });
            }
        };

        let (matched, score) = match similarity::decide(&user.embedding, &live, self.threshold) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!("Similarity computation failed for {}: {}", phone, err);
                self.log_attempt(phone, false, 0.0).await;
                return Err(VerificationError::Comparison(err));
            }
        };
        tracing::info!(
            "Voice comparison for {}: similarity={:.4}, threshold={}, match={}",
            phone,
            score,
            self.threshold,
            matched
        );

        self.log_attempt(phone, matched, score).await;

        let message = if matched {
            "verification successful".to_string()
        } else {
            format!("verification failed: {:.3} < {}", score, self.threshold)
        };
        Ok(VerifyOutcome {
            success: matched,
            message,
            score: Some(score),
        })
    }

    /// Recent attempts for a phone, newest first.
    pub async fn auth_history(&self, phone: &str, limit: i64) -> Result<Vec<AuthAttempt>, StoreError> {
        self.store.attempts_by_phone(phone, limit).await
    }

    /// Failed attempts in the trailing window. Errors count as zero so a
    /// store outage never blocks authentication.
    pub async fn recent_failures(&self, phone: &str, window_minutes: i64) -> i64 {
        match self.store.recent_failure_count(phone, window_minutes).await {
            Ok(count) => count,
            Err(err) => {
                tracing::error!("Failed to check recent failures for {}: {}", phone, err);
                0
            }
        }
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.health_check().await
    }

    pub async fn model_ready(&self) -> bool {
        self.extractor.ready().await
    }

    async fn log_attempt(&self, phone: &str, success: bool, score: f64) {
        let attempt = NewAuthAttempt {
            phone: phone.to_string(),
            success,
            score,
        };
        let result = with_retry(RETRY_ATTEMPTS, self.retry_backoff, || {
            self.store.log_attempt(attempt.clone())
        })
        .await;
        match result {
            Ok(record) => tracing::debug!(
                "Logged auth attempt {} for {}: success={}, score={:.4}",
                record.id,
                phone,
                success,
                score
            ),
            Err(err) => tracing::warn!("Failed to log auth attempt for {}: {}", phone, err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::pcm_to_wav;
    use crate::embedding::{Embedding, SpeakerEncoder, EMBEDDING_DIM};
    use crate::store::{AuthAttempt, MemoryStore};
    use async_trait::async_trait;

    struct ConstantEncoder(Vec<f64>);

    #[async_trait]
    impl SpeakerEncoder for ConstantEncoder {
        async fn encode(&self, _samples: &[f32]) -> Result<Embedding, EmbeddingError> {
            Ok(self.0.clone())
        }

        async fn ready(&self) -> bool {
            true
        }
    }

    struct FixedCapture(Vec<u8>);

    #[async_trait]
    impl LiveAudioSource for FixedCapture {
        async fn capture(
            &self,
            _listen_url: &str,
            _config: &CaptureConfig,
        ) -> Result<Vec<u8>, CaptureError> {
            Ok(self.0.clone())
        }
    }

    struct NoFetch;

    #[async_trait]
    impl crate::fetch::BlobFetcher for NoFetch {
        async fn fetch(&self, _url: &str) -> Result<bytes::Bytes, crate::fetch::FetchError> {
            Err(crate::fetch::FetchError::EmptyDownload)
        }
    }

    /// Store whose attempt log is broken while reads keep working.
    struct BrokenAuditStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl VoiceStore for BrokenAuditStore {
        async fn upsert_user(&self, user: Voiceprint) -> Result<Voiceprint, StoreError> {
            self.inner.upsert_user(user).await
        }

        async fn get_user_by_phone(&self, phone: &str) -> Result<Option<Voiceprint>, StoreError> {
            self.inner.get_user_by_phone(phone).await
        }

        async fn delete_user(&self, phone: &str) -> Result<bool, StoreError> {
            self.inner.delete_user(phone).await
        }

        async fn log_attempt(&self, _attempt: NewAuthAttempt) -> Result<AuthAttempt, StoreError> {
            Err(StoreError::Query("audit table missing".into()))
        }

        async fn attempts_by_phone(
            &self,
            phone: &str,
            limit: i64,
        ) -> Result<Vec<AuthAttempt>, StoreError> {
            self.inner.attempts_by_phone(phone, limit).await
        }

        async fn recent_failure_count(
            &self,
            phone: &str,
            window_minutes: i64,
        ) -> Result<i64, StoreError> {
            self.inner.recent_failure_count(phone, window_minutes).await
        }

        async fn health_check(&self) -> bool {
            self.inner.health_check().await
        }
    }

    fn tone_wav(seconds: f64) -> Vec<u8> {
        let samples = (seconds * 16000.0) as usize;
        let mut pcm = Vec::with_capacity(samples * 2);
        for n in 0..samples {
            let phase = 2.0 * std::f64::consts::PI * 200.0 * n as f64 / 16000.0;
            let value = (phase.sin() * 0.4 * 32767.0) as i16;
            pcm.extend_from_slice(&value.to_le_bytes());
        }
        pcm_to_wav(&pcm, 16000, 1, 2)
    }

    fn service_over(store: Arc<dyn VoiceStore>, embedding: Vec<f64>) -> AuthService {
        let extractor = Arc::new(crate::embedding::EmbeddingExtractor::with_encoder(
            Arc::new(ConstantEncoder(embedding)),
            Duration::from_secs(5),
        ));
        AuthService::new(
            store,
            Arc::new(NoFetch),
            Arc::new(FixedCapture(tone_wav(4.0))),
            extractor,
            CaptureConfig::default(),
            0.82,
        )
        .with_retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_change_outcome() {
        let store = Arc::new(BrokenAuditStore {
            inner: MemoryStore::new(),
        });
        let embedding = vec![0.25; EMBEDDING_DIM];
        store
            .upsert_user(Voiceprint {
                phone: "+15551230000".into(),
                id: Uuid::new_v4(),
                embedding: embedding.clone(),
                enrolled_at: Utc::now(),
            })
            .await
            .unwrap();

        let service = service_over(store, embedding);
        let outcome = service
            .verify_user("+15551230000", "wss://bridge/listen")
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.score, Some(1.0));
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_store_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let service = service_over(store, vec![0.25; EMBEDDING_DIM]);
        let err = service
            .verify_user("+15551230000", "wss://bridge/listen")
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Store(_)));
    }

    #[tokio::test]
    async fn test_recent_failures_swallow_store_errors() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let service = service_over(store, vec![0.25; EMBEDDING_DIM]);
        assert_eq!(service.recent_failures("+15551230000", 60).await, 0);
    }
}
