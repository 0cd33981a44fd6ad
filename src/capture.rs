//! Live audio capture from a provider WebSocket stream.
//!
//! The stream delivers UTF-8 text frames, each a JSON object that may carry
//! `{"audio": "<base64 PCM>"}`. Payloads are raw 16-bit little-endian PCM at
//! 16 kHz mono; capture concatenates them in arrival order and wraps the
//! result in a canonical WAV container once endpointing decides the speaker
//! is done.

use std::cmp;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use http::Uri;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_websockets::ClientBuilder;

use crate::audio::{frame_rms, pcm_to_wav, CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE, CANONICAL_SAMPLE_WIDTH};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid listen url: {0}")]
    BadUrl(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection closed before any audio arrived")]
    ConnectionClosed,
    #[error("no audio data captured")]
    NoAudioCaptured,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub min_duration: Duration,
    pub silence_threshold: f64,
    pub silence_duration: Duration,
    pub max_duration: Duration,
    pub connect_timeout: Duration,
    pub session_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_secs_f64(3.0),
            silence_threshold: 0.01,
            silence_duration: Duration::from_secs_f64(2.0),
            max_duration: Duration::from_secs_f64(30.0),
            connect_timeout: Duration::from_secs_f64(10.0),
            session_timeout: Duration::from_secs_f64(65.0),
        }
    }
}

/// Capture session lifecycle, tracked for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Capturing,
    Draining,
    Done,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Capturing => "capturing",
            SessionState::Draining => "draining",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxDuration,
    Silence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop(StopReason),
}

/// Silence-gated endpointing over elapsed capture time.
///
/// Pure with respect to the clock: callers pass the elapsed time with each
/// observation, which keeps the timer rules testable without real sleeps.
pub struct Endpointer {
    min_duration: Duration,
    silence_threshold: f64,
    silence_duration: Duration,
    max_duration: Duration,
    silence_since: Option<Duration>,
}

impl Endpointer {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            min_duration: config.min_duration,
            silence_threshold: config.silence_threshold,
            silence_duration: config.silence_duration,
            max_duration: config.max_duration,
            silence_since: None,
        }
    }

    /// Feed one audio-bearing frame observed at `elapsed` since capture start.
    pub fn observe(&mut self, pcm: &[u8], elapsed: Duration) -> Verdict {
        let rms = frame_rms(pcm);
        if rms < self.silence_threshold {
            if self.silence_since.is_none() {
                tracing::debug!("Silence timer started: rms={:.4}", rms);
                self.silence_since = Some(elapsed);
            }
        } else {
            self.silence_since = None;
        }
        // Silence before the minimum window never ends capture.
        if elapsed < self.min_duration {
            self.silence_since = None;
        }
        self.verdict(elapsed)
    }

    /// Time-only check, for streams that stop producing audio frames.
    pub fn verdict(&self, elapsed: Duration) -> Verdict {
        if elapsed >= self.max_duration {
            return Verdict::Stop(StopReason::MaxDuration);
        }
        if let Some(since) = self.silence_since {
            if elapsed.saturating_sub(since) >= self.silence_duration {
                return Verdict::Stop(StopReason::Silence);
            }
        }
        Verdict::Continue
    }
}

#[derive(Deserialize)]
struct StreamFrame {
    audio: Option<String>,
}

/// Decode one text frame. Frames without an audio key yield `None` silently;
/// malformed JSON or base64 is logged and skipped so a noisy stream cannot
/// truncate capture.
fn decode_audio_frame(text: &str) -> Option<Vec<u8>> {
    let frame: StreamFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!("Skipping non-JSON stream frame: {}", err);
            return None;
        }
    };
    let encoded = frame.audio?;
    match STANDARD.decode(encoded.as_bytes()) {
        Ok(pcm) => Some(pcm),
        Err(err) => {
            tracing::warn!("Skipping frame with invalid base64 audio: {}", err);
            None
        }
    }
}

#[async_trait]
pub trait LiveAudioSource: Send + Sync {
    /// Capture one utterance from the stream at `listen_url`, returning a
    /// canonical WAV blob.
    async fn capture(&self, listen_url: &str, config: &CaptureConfig) -> Result<Vec<u8>, CaptureError>;
}

/// WebSocket-backed capture engine.
pub struct WsCapture;

#[async_trait]
impl LiveAudioSource for WsCapture {
    async fn capture(&self, listen_url: &str, config: &CaptureConfig) -> Result<Vec<u8>, CaptureError> {
        capture_session(listen_url, config).await
    }
}

pub async fn capture_session(listen_url: &str, config: &CaptureConfig) -> Result<Vec<u8>, CaptureError> {
    let uri: Uri = listen_url
        .parse()
        .map_err(|_| CaptureError::BadUrl(listen_url.to_string()))?;
    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        _ => return Err(CaptureError::BadUrl(listen_url.to_string())),
    }

    let mut state = SessionState::Idle;
    tracing::debug!("Capture session {}: {}", state, listen_url);
    let session_start = Instant::now();
    let session_deadline = session_start + config.session_timeout;

    state = SessionState::Connecting;
    tracing::info!("Capture session {}: {}", state, listen_url);
    let builder = ClientBuilder::from_uri(uri);
    let (mut ws, _) = match timeout(config.connect_timeout, builder.connect()).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => {
            tracing::error!("WebSocket connection failed: {}", err);
            return Err(CaptureError::Connection(err.to_string()));
        }
        Err(_) => {
            tracing::error!(
                "Timeout connecting to audio stream after {:?}",
                config.connect_timeout
            );
            return Err(CaptureError::Connection(format!(
                "connection timeout after {:.1}s",
                config.connect_timeout.as_secs_f64()
            )));
        }
    };

    state = SessionState::Capturing;
    let capture_start = Instant::now();
    let deadline = cmp::min(capture_start + config.max_duration, session_deadline);
    tracing::info!(
        "Capture session {}: max {:.1}s, silence gate {:.1}s",
        state,
        config.max_duration.as_secs_f64(),
        config.silence_duration.as_secs_f64()
    );

    let mut endpointer = Endpointer::new(config);
    let mut pcm: Vec<u8> = Vec::new();
    let mut remote_closed = false;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                tracing::info!("Stopping capture: maximum duration reached");
                break;
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(message)) => {
                        if message.is_close() {
                            remote_closed = true;
                            break;
                        }
                        let Some(text) = message.as_text() else {
                            continue;
                        };
                        let Some(chunk) = decode_audio_frame(text) else {
                            continue;
                        };
                        if chunk.is_empty() {
                            continue;
                        }
                        pcm.extend_from_slice(&chunk);
                        if let Verdict::Stop(reason) = endpointer.observe(&chunk, capture_start.elapsed()) {
                            tracing::info!("Stopping capture: {:?}", reason);
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!("WebSocket error during capture: {}", err);
                        remote_closed = true;
                        break;
                    }
                    None => {
                        remote_closed = true;
                        break;
                    }
                }
            }
        }
    }

    SinkExt::close(&mut ws).await.ok();

    if remote_closed && pcm.is_empty() {
        state = SessionState::Failed;
        tracing::error!("Capture session {}: connection closed during capture", state);
        return Err(CaptureError::ConnectionClosed);
    }
    if pcm.is_empty() {
        state = SessionState::Failed;
        tracing::error!("Capture session {}: no audio data captured", state);
        return Err(CaptureError::NoAudioCaptured);
    }

    state = SessionState::Draining;
    let total = capture_start.elapsed();
    tracing::info!(
        "Capture session {}: {} bytes over {:.1}s",
        state,
        pcm.len(),
        total.as_secs_f64()
    );
    let wav = pcm_to_wav(
        &pcm,
        CANONICAL_SAMPLE_RATE,
        CANONICAL_CHANNELS,
        CANONICAL_SAMPLE_WIDTH,
    );
    state = SessionState::Done;
    tracing::debug!("Capture session {}", state);
    Ok(wav)
}
