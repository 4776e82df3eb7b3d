//! Audio decode/encode helpers for the separation path.

use std::{
    fs::File,
    io::{Cursor, ErrorKind},
    path::Path,
    sync::Arc,
};

use base64::Engine;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CODEC_TYPE_NULL, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{0}")]
    Unavailable(String),
    #[error("wav encoding failed: {0}")]
    Failed(#[from] hound::Error),
}

/// Encodes mono float samples into a transportable audio container.
pub trait AudioEncoder: Send + Sync {
    fn encode_wav(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, EncodeError>;
}

/// 32-bit float mono WAV via `hound`.
pub struct WavEncoder;

impl AudioEncoder for WavEncoder {
    fn encode_wav(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, EncodeError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut buf, spec)?;
            for &sample in samples {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }
        Ok(buf.into_inner())
    }
}

/// Stand-in used when the build carries no WAV encoder.
pub struct UnavailableEncoder {
    pub reason: String,
}

impl AudioEncoder for UnavailableEncoder {
    fn encode_wav(&self, _samples: &[f32], _sample_rate: u32) -> Result<Vec<u8>, EncodeError> {
        Err(EncodeError::Unavailable(self.reason.clone()))
    }
}

#[cfg(feature = "wav-encoding")]
pub fn default_encoder() -> Arc<dyn AudioEncoder> {
    Arc::new(WavEncoder)
}

#[cfg(not(feature = "wav-encoding"))]
pub fn default_encoder() -> Arc<dyn AudioEncoder> {
    Arc::new(UnavailableEncoder {
        reason: "worker built without the `wav-encoding` feature".into(),
    })
}

pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Why an uploaded audio file could not be turned into samples.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("could not open audio file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported audio: {0}")]
    Unsupported(String),
}

/// Decodes any container symphonia can probe into mono `f32` in `[-1, 1]`
/// plus its sample rate. The file extension is only a probe hint.
pub fn decode_audio_file(path: &Path) -> Result<(Vec<f32>, u32), DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::Unsupported("no audio track found".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Unsupported(e.to_string()))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut channels = 1usize;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!(error = %e, "stopped reading audio packets");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable audio packet");
                continue;
            }
        };
        let spec = *decoded.spec();
        channels = spec.channels.count().max(1);
        sample_rate.get_or_insert(spec.rate);

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buf.samples());
    }

    let sample_rate =
        sample_rate.ok_or_else(|| DecodeError::Unsupported("unknown sample rate".into()))?;
    if interleaved.is_empty() {
        return Err(DecodeError::Unsupported("no audio samples decoded".into()));
    }

    let mono: Vec<f32> = if channels > 1 {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        interleaved
    };

    Ok((
        mono.into_iter()
            .map(|s| if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 })
            .collect(),
        sample_rate,
    ))
}

/// Linear-interpolation resampler; adequate for model input conditioning.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}
