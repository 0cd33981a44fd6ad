//! Speaker embedding extraction.
//!
//! The speaker model itself is an external collaborator behind the
//! [`SpeakerEncoder`] trait; the default binding posts canonical WAV audio to
//! a model server. The encoder handle is built once per process the first
//! time an extraction needs it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::timeout;

use crate::audio::{self, AudioError, CANONICAL_SAMPLE_RATE};

pub const EMBEDDING_DIM: usize = 192;
/// Shortest waveform the model accepts: 0.5 s at 16 kHz.
pub const MIN_WAVEFORM_SAMPLES: usize = 8_000;
pub const DEFAULT_INFERENCE_DEADLINE: Duration = Duration::from_secs(15);

pub type Embedding = Vec<f64>;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("speaker model unavailable: {0}")]
    Unavailable(String),
    #[error("embedding inference timed out")]
    Timeout,
    #[error("waveform too short for embedding ({0} samples)")]
    WaveformTooShort(usize),
    #[error("unexpected embedding dimension: {0}, expected {EMBEDDING_DIM}")]
    Dimension(usize),
    #[error("generated embedding failed validation")]
    Invalid,
    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// True iff the vector has the model dimension, only finite values, and is
/// not identically zero.
pub fn validate_embedding(embedding: &[f64]) -> bool {
    embedding.len() == EMBEDDING_DIM
        && embedding.iter().all(|value| value.is_finite())
        && embedding.iter().any(|value| value.abs() > f64::EPSILON)
}

#[async_trait]
pub trait SpeakerEncoder: Send + Sync {
    async fn encode(&self, samples: &[f32]) -> Result<Embedding, EmbeddingError>;
    async fn ready(&self) -> bool;
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Embedding,
}

/// Encoder bound to an HTTP model server.
pub struct RemoteEncoder {
    client: reqwest::Client,
    embed_url: String,
    health_url: String,
}

impl RemoteEncoder {
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            embed_url: format!("{base}/api/v1/embeddings"),
            health_url: format!("{base}/healthz"),
        }
    }
}

#[async_trait]
impl SpeakerEncoder for RemoteEncoder {
    async fn encode(&self, samples: &[f32]) -> Result<Embedding, EmbeddingError> {
        let wav = audio::samples_to_wav(samples, CANONICAL_SAMPLE_RATE);
        let response = self
            .client
            .post(&self.embed_url)
            .header(CONTENT_TYPE, "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|err| EmbeddingError::Unavailable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::Unavailable(format!(
                "model server returned {status}"
            )));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| EmbeddingError::Unavailable(err.to_string()))?;
        Ok(parsed.embedding)
    }

    async fn ready(&self) -> bool {
        match self.client.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

type EncoderFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn SpeakerEncoder>, EmbeddingError>> + Send + Sync>;

/// Waveform-to-vector front end over a lazily initialized encoder.
pub struct EmbeddingExtractor {
    encoder: OnceCell<Arc<dyn SpeakerEncoder>>,
    factory: EncoderFactory,
    inference_deadline: Duration,
}

impl EmbeddingExtractor {
    pub fn new(factory: EncoderFactory, inference_deadline: Duration) -> Self {
        Self {
            encoder: OnceCell::new(),
            factory,
            inference_deadline,
        }
    }

    /// Extractor bound to an HTTP model server.
    pub fn remote(model_url: &str, inference_deadline: Duration) -> Self {
        let base = model_url.to_string();
        Self::new(
            Box::new(move || {
                let base = base.clone();
                async move {
                    tracing::info!("Initializing speaker encoder at {}", base);
                    Ok(Arc::new(RemoteEncoder::new(&base)) as Arc<dyn SpeakerEncoder>)
                }
                .boxed()
            }),
            inference_deadline,
        )
    }

    /// Extractor over a pre-built encoder, used by tests and embedded setups.
    pub fn with_encoder(encoder: Arc<dyn SpeakerEncoder>, inference_deadline: Duration) -> Self {
        Self::new(Box::new(move || {
            let encoder = encoder.clone();
            async move { Ok(encoder) }.boxed()
        }), inference_deadline)
    }

    async fn encoder(&self) -> Result<&Arc<dyn SpeakerEncoder>, EmbeddingError> {
        self.encoder.get_or_try_init(|| (self.factory)()).await
    }

    /// Whether the encoder is initialized and answering.
    pub async fn ready(&self) -> bool {
        match self.encoder().await {
            Ok(encoder) => encoder.ready().await,
            Err(err) => {
                tracing::warn!("Speaker encoder initialization failed: {}", err);
                false
            }
        }
    }

    /// Produce a speaker embedding from a 16-bit PCM WAV blob.
    pub async fn extract(&self, wav: &[u8]) -> Result<Embedding, EmbeddingError> {
        let (rate, channels, samples) = audio::wav_samples(wav)?;
        let mono = audio::downmix(samples, channels);
        let mono = if rate != CANONICAL_SAMPLE_RATE {
            audio::resample(mono, rate, CANONICAL_SAMPLE_RATE)?
        } else {
            mono
        };
        if mono.len() < MIN_WAVEFORM_SAMPLES {
            return Err(EmbeddingError::WaveformTooShort(mono.len()));
        }

        let encoder = self.encoder().await?;
        let embedding = timeout(self.inference_deadline, encoder.encode(&mono))
            .await
            .map_err(|_| EmbeddingError::Timeout)??;

        if embedding.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::Dimension(embedding.len()));
        }
        if !validate_embedding(&embedding) {
            return Err(EmbeddingError::Invalid);
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::pcm_to_wav;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic stand-in for the speaker model: averages fixed-width
    /// bands of the waveform into a 192-dim vector.
    pub struct BandEncoder {
        pub calls: AtomicUsize,
    }

    impl BandEncoder {
        pub fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl SpeakerEncoder for BandEncoder {
        async fn encode(&self, samples: &[f32]) -> Result<Embedding, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let band = (samples.len() / EMBEDDING_DIM).max(1);
            let mut embedding = Vec::with_capacity(EMBEDDING_DIM);
            for index in 0..EMBEDDING_DIM {
                let start = (index * band).min(samples.len());
                let end = ((index + 1) * band).min(samples.len());
                let sum: f32 = samples[start..end].iter().map(|s| s.abs()).sum();
                embedding.push(sum as f64 + 1e-3);
            }
            Ok(embedding)
        }

        async fn ready(&self) -> bool {
            true
        }
    }

    fn tone_wav(seconds: f64) -> Vec<u8> {
        let samples = (seconds * 16000.0) as usize;
        let mut pcm = Vec::with_capacity(samples * 2);
        for n in 0..samples {
            let phase = 2.0 * std::f64::consts::PI * 220.0 * n as f64 / 16000.0;
            let value = (phase.sin() * 0.4 * 32767.0) as i16;
            pcm.extend_from_slice(&value.to_le_bytes());
        }
        pcm_to_wav(&pcm, 16000, 1, 2)
    }

    #[test]
    fn test_validate_embedding() {
        assert!(validate_embedding(&vec![0.1; EMBEDDING_DIM]));
        assert!(!validate_embedding(&vec![0.1; EMBEDDING_DIM - 1]));
        assert!(!validate_embedding(&vec![0.0; EMBEDDING_DIM]));
        let mut with_nan = vec![0.1; EMBEDDING_DIM];
        with_nan[10] = f64::NAN;
        assert!(!validate_embedding(&with_nan));
        let mut with_inf = vec![0.1; EMBEDDING_DIM];
        with_inf[3] = f64::INFINITY;
        assert!(!validate_embedding(&with_inf));
    }

    #[tokio::test]
    async fn test_extract_produces_valid_embedding() {
        let extractor =
            EmbeddingExtractor::with_encoder(Arc::new(BandEncoder::new()), Duration::from_secs(5));
        let embedding = extractor.extract(&tone_wav(2.0)).await.unwrap();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        assert!(validate_embedding(&embedding));
    }

    #[tokio::test]
    async fn test_extract_rejects_short_waveform() {
        let extractor =
            EmbeddingExtractor::with_encoder(Arc::new(BandEncoder::new()), Duration::from_secs(5));
        let err = extractor.extract(&tone_wav(0.25)).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::WaveformTooShort(4000)));
    }

    #[tokio::test]
    async fn test_encoder_initialized_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let extractor = EmbeddingExtractor::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Arc::new(BandEncoder::new()) as Arc<dyn SpeakerEncoder>) }.boxed()
            }),
            Duration::from_secs(5),
        );
        let wav = tone_wav(1.0);
        extractor.extract(&wav).await.unwrap();
        extractor.extract(&wav).await.unwrap();
        assert!(extractor.ready().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inference_deadline() {
        struct SlowEncoder;

        #[async_trait]
        impl SpeakerEncoder for SlowEncoder {
            async fn encode(&self, _samples: &[f32]) -> Result<Embedding, EmbeddingError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![0.1; EMBEDDING_DIM])
            }

            async fn ready(&self) -> bool {
                true
            }
        }

        let extractor =
            EmbeddingExtractor::with_encoder(Arc::new(SlowEncoder), Duration::from_millis(50));
        let err = extractor.extract(&tone_wav(1.0)).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Timeout));
    }

    #[tokio::test]
    async fn test_bad_dimension_rejected() {
        struct StubEncoder(usize);

        #[async_trait]
        impl SpeakerEncoder for StubEncoder {
            async fn encode(&self, _samples: &[f32]) -> Result<Embedding, EmbeddingError> {
                Ok(vec![0.5; self.0])
            }

            async fn ready(&self) -> bool {
                true
            }
        }

        let extractor =
            EmbeddingExtractor::with_encoder(Arc::new(StubEncoder(64)), Duration::from_secs(1));
        let err = extractor.extract(&tone_wav(1.0)).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Dimension(64)));
    }
}
