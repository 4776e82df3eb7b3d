use std::{io::Write, path::Path, sync::Arc, time::Instant};

use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{info, warn};

use crate::{
    audio::{AudioEncoder, to_base64},
    error::ServiceError,
    model::{
        BackendKind, InferenceInput, InferenceOutput, ModelRegistry, SeparatedTracks,
        SeparationInput,
    },
};

#[derive(Debug, Default)]
pub struct SeparationRequest {
    pub audio: Vec<u8>,
    pub filename: Option<String>,
    pub description: String,
    pub anchors_json: String,
    pub reranking_candidates: i64,
    pub predict_spans: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SeparationResponse {
    Encoded {
        ok: bool,
        sample_rate: u32,
        target_wav_base64: String,
        residual_wav_base64: String,
    },
    /// Raw samples returned when WAV encoding is unavailable.
    Fallback {
        ok: bool,
        sample_rate: u32,
        warning: String,
        target: Vec<f32>,
        residual: Vec<f32>,
    },
    Rejected {
        ok: bool,
        error: String,
    },
}

pub async fn separate(
    registry: &ModelRegistry,
    encoder: Arc<dyn AudioEncoder>,
    request: SeparationRequest,
) -> Result<SeparationResponse, ServiceError> {
    if request.audio.is_empty() {
        return Ok(SeparationResponse::Rejected {
            ok: false,
            error: "Empty upload".into(),
        });
    }

    let backend = registry.ensure_loaded(BackendKind::SamAudio).await?;
    let anchors = parse_anchors(&request.anchors_json)?;
    let suffix = upload_suffix(request.filename.as_deref());
    let start = Instant::now();

    let SeparationRequest {
        audio,
        description,
        reranking_candidates,
        predict_spans,
        ..
    } = request;

    let tracks = task::spawn_blocking(move || {
        // Deleted when `upload` drops, whichever way this closure exits.
        let upload = persist_upload(&audio, &suffix)?;
        let output = backend.infer(InferenceInput::Separation(SeparationInput {
            audio_path: upload.path().to_path_buf(),
            description,
            anchors,
            reranking_candidates: u32::try_from(reranking_candidates)
                .ok()
                .filter(|&n| n > 0),
            predict_spans,
        }))?;
        match output {
            InferenceOutput::Separation(tracks) => Ok(tracks),
            _ => Err(ServiceError::Inference(
                "separation backend returned a non-separation output".into(),
            )),
        }
    })
    .await
    .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))??;

    info!(
        sample_rate = tracks.sample_rate,
        samples = tracks.target.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "separation complete"
    );

    Ok(encode_tracks(encoder.as_ref(), tracks))
}

fn parse_anchors(raw: &str) -> Result<Option<serde_json::Value>, ServiceError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| ServiceError::BadRequest(format!("anchors_json is not valid JSON: {e}")))
}

fn upload_suffix(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| ".bin".to_string())
}

fn persist_upload(bytes: &[u8], suffix: &str) -> Result<NamedTempFile, ServiceError> {
    let mut file = tempfile::Builder::new()
        .prefix("vocalx-upload-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

/// Never fails: an encoder error downgrades to raw samples plus a warning.
fn encode_tracks(encoder: &dyn AudioEncoder, tracks: SeparatedTracks) -> SeparationResponse {
    let rate = tracks.sample_rate;
    let encoded = encoder.encode_wav(&tracks.target, rate).and_then(|target| {
        let residual = encoder.encode_wav(&tracks.residual, rate)?;
        Ok((target, residual))
    });

    match encoded {
        Ok((target, residual)) => SeparationResponse::Encoded {
            ok: true,
            sample_rate: rate,
            target_wav_base64: to_base64(&target),
            residual_wav_base64: to_base64(&residual),
        },
        Err(err) => {
            warn!(error = %err, "WAV encoding unavailable, returning raw samples");
            SeparationResponse::Fallback {
                ok: true,
                sample_rate: rate,
                warning: format!(
                    "WAV encoding unavailable ({err}); returning float arrays instead"
                ),
                target: tracks.target,
                residual: tracks.residual,
            }
        }
    }
}
