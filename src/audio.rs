//! Audio normalization to the canonical pipeline format: 16 kHz mono
//! signed 16-bit PCM in a RIFF/WAVE container.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::errors::Error as SymError;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::probe::Hint;
use thiserror::Error;

pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;
pub const CANONICAL_CHANNELS: u16 = 1;
pub const CANONICAL_SAMPLE_WIDTH: u16 = 2;
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio input is empty")]
    EmptyInput,
    #[error("audio could not be decoded: {0}")]
    UnsupportedOrCorrupt(String),
    #[error("audio data too short to contain a WAV header")]
    TruncatedHeader,
    #[error("invalid audio: {0}")]
    ValidationFailed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct WavInfo {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_offset: usize,
    pub data_len: usize,
}

impl WavInfo {
    pub fn is_canonical(&self) -> bool {
        self.audio_format == 1
            && self.channels == CANONICAL_CHANNELS
            && self.sample_rate == CANONICAL_SAMPLE_RATE
            && self.bits_per_sample == 16
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bits_per_sample / 8) as u32
    }
}

/// Walk the RIFF chunk list and pull out the fmt and data chunks.
pub fn parse_wav_header(bytes: &[u8]) -> Result<WavInfo, AudioError> {
    if bytes.len() < WAV_HEADER_LEN {
        return Err(AudioError::TruncatedHeader);
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(AudioError::ValidationFailed("not a RIFF/WAVE file".into()));
    }

    let mut cursor = Cursor::new(bytes);
    cursor.set_position(12);
    let mut fmt: Option<(u16, u16, u32, u16)> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        read_bytes(&mut cursor, &mut chunk_id)?;
        let chunk_size = read_u32(&mut cursor)? as usize;
        let chunk_start = cursor.position() as usize;

        match &chunk_id {
            b"fmt " => {
                if chunk_size < 16 {
                    return Err(AudioError::ValidationFailed("fmt chunk too small".into()));
                }
                let audio_format = read_u16(&mut cursor)?;
                let channels = read_u16(&mut cursor)?;
                let sample_rate = read_u32(&mut cursor)?;
                let _byte_rate = read_u32(&mut cursor)?;
                let _block_align = read_u16(&mut cursor)?;
                let bits_per_sample = read_u16(&mut cursor)?;
                fmt = Some((audio_format, channels, sample_rate, bits_per_sample));
                cursor.set_position((chunk_start + chunk_size) as u64);
            }
            b"data" => {
                let (audio_format, channels, sample_rate, bits_per_sample) = fmt.ok_or_else(
                    || AudioError::ValidationFailed("data chunk before fmt chunk".into()),
                )?;
                let data_len = chunk_size.min(bytes.len().saturating_sub(chunk_start));
                return Ok(WavInfo {
                    audio_format,
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: chunk_start,
                    data_len,
                });
            }
            _ => {
                cursor.set_position((chunk_start + chunk_size) as u64);
            }
        }
        if cursor.position() as usize >= bytes.len() {
            return Err(AudioError::ValidationFailed("no data chunk found".into()));
        }
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<(), AudioError> {
    cursor.read_exact(buf).map_err(truncated)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, AudioError> {
    cursor.read_u16::<LittleEndian>().map_err(truncated)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, AudioError> {
    cursor.read_u32::<LittleEndian>().map_err(truncated)
}

fn truncated(_: io::Error) -> AudioError {
    AudioError::TruncatedHeader
}

/// Wrap raw PCM bytes in a fixed 44-byte RIFF/WAVE header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, sample_width: u16) -> Vec<u8> {
    let data_size = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * sample_width as u32;
    let block_align = channels * sample_width;

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(data_size + 36).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&(sample_width * 8).to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Check that the bytes are a canonical 16 kHz mono 16-bit PCM WAV.
pub fn validate(wav: &[u8]) -> (bool, String) {
    let info = match parse_wav_header(wav) {
        Ok(info) => info,
        Err(err) => return (false, err.to_string()),
    };
    if info.audio_format != 1 {
        return (false, format!("expected PCM format, got format {}", info.audio_format));
    }
    if info.channels != CANONICAL_CHANNELS {
        return (false, format!("expected mono (1 channel), got {} channels", info.channels));
    }
    if info.sample_rate != CANONICAL_SAMPLE_RATE {
        return (false, format!("expected 16kHz sample rate, got {}Hz", info.sample_rate));
    }
    if info.bits_per_sample != 16 {
        return (false, format!("expected 16-bit samples, got {}-bit", info.bits_per_sample));
    }
    (true, "valid 16kHz mono WAV".to_string())
}

/// Duration derived from the header fields and payload size alone.
pub fn duration_seconds(wav: &[u8]) -> Result<f64, AudioError> {
    let info = parse_wav_header(wav)?;
    let byte_rate = info.byte_rate();
    if byte_rate == 0 {
        return Err(AudioError::ValidationFailed("zero byte rate".into()));
    }
    Ok(info.data_len as f64 / byte_rate as f64)
}

/// Decode any supported container to interleaved f32 samples.
fn decode_to_pcm(input: &[u8], format_hint: Option<&str>) -> Result<(u32, u16, Vec<f32>), AudioError> {
    let cursor = io::Cursor::new(input.to_vec());
    let media_stream = MediaSourceStream::new(Box::new(cursor), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = format_hint {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, media_stream, &Default::default(), &Default::default())
        .map_err(|err| AudioError::UnsupportedOrCorrupt(err.to_string()))?;
    let mut format_reader = probed.format;
    let track = format_reader
        .default_track()
        .ok_or_else(|| AudioError::UnsupportedOrCorrupt("no audio track".into()))?
        .clone();
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::UnsupportedOrCorrupt("no sample rate".into()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &Default::default())
        .map_err(|err| AudioError::UnsupportedOrCorrupt(err.to_string()))?;
    let mut channels: u16 = 0;
    let mut pcm_data = None;
    let mut samples = Vec::new();

    while let Ok(packet) = format_reader.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                if pcm_data.is_none() {
                    let spec = *audio_buf.spec();
                    channels = spec.channels.count() as u16;
                    let duration = audio_buf.capacity() as u64;
                    pcm_data = Some(SampleBuffer::<f32>::new(duration, spec));
                }
                if let Some(buf) = &mut pcm_data {
                    buf.copy_interleaved_ref(audio_buf);
                    samples.extend(buf.samples());
                }
            }
            Err(SymError::DecodeError(_)) => (),
            Err(_) => break,
        }
    }

    if samples.is_empty() || channels == 0 {
        return Err(AudioError::UnsupportedOrCorrupt("no audio frames decoded".into()));
    }
    Ok((rate, channels, samples))
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: Vec<f32>, channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples;
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn resample(input: Vec<f32>, from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input);
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.8,
        interpolation: SincInterpolationType::Nearest,
        oversampling_factor: 256,
        window: rubato::WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, input.len(), 1)
        .map_err(|err| AudioError::UnsupportedOrCorrupt(err.to_string()))?;
    let mut output = resampler
        .process(&[input], None)
        .map_err(|err| AudioError::UnsupportedOrCorrupt(err.to_string()))?;
    Ok(output.pop().unwrap_or_default())
}

fn quantize_i16(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}

/// Quantize f32 samples and wrap them as a mono 16-bit WAV.
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    pcm_to_wav(
        &quantize_i16(samples),
        sample_rate,
        CANONICAL_CHANNELS,
        CANONICAL_SAMPLE_WIDTH,
    )
}

/// Convert any common audio container to the canonical WAV form.
///
/// Input that is already canonical is re-wrapped without a decode pass, so
/// normalizing twice yields byte-identical output.
pub fn normalize(input: &[u8], format_hint: Option<&str>) -> Result<Vec<u8>, AudioError> {
    if input.is_empty() {
        return Err(AudioError::EmptyInput);
    }
    if let Ok(info) = parse_wav_header(input) {
        if info.is_canonical() {
            let data = &input[info.data_offset..info.data_offset + info.data_len];
            return Ok(pcm_to_wav(data, CANONICAL_SAMPLE_RATE, CANONICAL_CHANNELS, CANONICAL_SAMPLE_WIDTH));
        }
    }
    let (rate, channels, samples) = decode_to_pcm(input, format_hint)?;
    let mono = downmix(samples, channels);
    let mono = resample(mono, rate, CANONICAL_SAMPLE_RATE)?;
    Ok(samples_to_wav(&mono, CANONICAL_SAMPLE_RATE))
}

/// Interleaved f32 samples from a 16-bit PCM WAV, with its rate and channels.
pub fn wav_samples(wav: &[u8]) -> Result<(u32, u16, Vec<f32>), AudioError> {
    let info = parse_wav_header(wav)?;
    if info.audio_format != 1 || info.bits_per_sample != 16 {
        return Err(AudioError::ValidationFailed(
            "expected 16-bit PCM samples".into(),
        ));
    }
    let data = &wav[info.data_offset..info.data_offset + info.data_len];
    let samples = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok((info.sample_rate, info.channels, samples))
}

/// RMS amplitude of a 16-bit PCM frame, normalized to [0, 1].
pub fn frame_rms(pcm: &[u8]) -> f64 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt() / 32767.0
}
