use std::time::Instant;

use serde::Serialize;
use tokio::task;
use tracing::info;

use crate::{
    error::ServiceError,
    model::{
        BackendKind, InferenceInput, InferenceOutput, ModelRegistry, SegmentationInput,
        processor::{SegmentationResult, post_process_instances},
    },
};

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MASK_THRESHOLD: f32 = 0.5;

#[derive(Debug)]
pub struct SegmentationRequest {
    pub image: Vec<u8>,
    pub prompt: String,
    pub threshold: f32,
    pub mask_threshold: f32,
}

/// Masks are sent as raw nested 0/1 arrays; large, but simple for clients.
#[derive(Debug, Serialize)]
pub struct SegmentationResponse {
    pub ok: bool,
    pub prompt: String,
    #[serde(flatten)]
    pub result: SegmentationResult,
}

pub async fn segment(
    registry: &ModelRegistry,
    request: SegmentationRequest,
) -> Result<SegmentationResponse, ServiceError> {
    for (name, value) in [
        ("threshold", request.threshold),
        ("mask_threshold", request.mask_threshold),
    ] {
        if !value.is_finite() {
            return Err(ServiceError::BadRequest(format!("{name} must be a finite number")));
        }
    }

    let backend = registry.ensure_loaded(BackendKind::Sam3).await?;

    let SegmentationRequest {
        image,
        prompt,
        threshold,
        mask_threshold,
    } = request;
    let start = Instant::now();
    let prompt_for_backend = prompt.clone();

    let result = task::spawn_blocking(move || {
        let image = image::load_from_memory(&image)
            .map_err(|e| ServiceError::BadRequest(format!("could not decode image: {e}")))?
            .to_rgb8();
        let output = backend.infer(InferenceInput::Segmentation(SegmentationInput {
            image,
            prompt: prompt_for_backend,
        }))?;
        let InferenceOutput::Segmentation(raw) = output else {
            return Err(ServiceError::Inference(
                "segmentation backend returned a non-segmentation output".into(),
            ));
        };
        post_process_instances(&raw, threshold, mask_threshold)
    })
    .await
    .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))??;

    info!(
        num_objects = result.num_objects,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "segmentation complete"
    );

    Ok(SegmentationResponse {
        ok: true,
        prompt,
        result,
    })
}
