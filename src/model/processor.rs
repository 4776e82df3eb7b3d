//! Pre- and post-processing shared by the TorchScript backends and the
//! dispatchers.
//!
//! Everything here is plain `ndarray`/`image` math so it can be exercised
//! without a model runtime.

use std::path::Path;

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::Serialize;
use tokenizers::Tokenizer;

use crate::{error::ServiceError, model::RawSegmentation};

/// Square input side expected by the SAM3 vision encoder.
pub const SAM3_IMAGE_SIZE: u32 = 1008;
const SAM3_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const SAM3_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Text encoder context length; prompts are truncated or padded to it.
pub const PROMPT_CONTEXT_LEN: usize = 32;

/// Instances kept after thresholding, in query order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentationResult {
    pub num_objects: usize,
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub mask_shapes: Vec<[usize; 2]>,
    pub masks: Vec<Vec<Vec<u8>>>,
}

/// Resizes to `side`×`side` and normalizes into a `[3, side, side]` tensor.
pub fn image_to_chw(image: &RgbImage, side: u32) -> Array3<f32> {
    let resized = image::imageops::resize(image, side, side, FilterType::Triangle);
    let side = side as usize;
    let mut out = Array3::<f32>::zeros((3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel.0[c] as f32 / 255.0;
            out[[c, y as usize, x as usize]] = (v - SAM3_MEAN[c]) / SAM3_STD[c];
        }
    }
    out
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Turns raw detector output into discrete instances.
///
/// A query survives when `sigmoid(logit) * sigmoid(presence) > threshold`.
/// Boxes come back as `[x0, y0, x1, y1]` in original pixel coordinates and
/// masks are upsampled to the original size then binarized at
/// `mask_threshold`.
pub fn post_process_instances(
    raw: &RawSegmentation,
    threshold: f32,
    mask_threshold: f32,
) -> Result<SegmentationResult, ServiceError> {
    let queries = raw.logits.len();
    if raw.boxes.nrows() != queries || raw.boxes.ncols() != 4 {
        return Err(ServiceError::Inference(format!(
            "expected boxes of shape [{queries}, 4], got {:?}",
            raw.boxes.shape()
        )));
    }
    if raw.mask_logits.len_of(Axis(0)) != queries {
        return Err(ServiceError::Inference(format!(
            "expected {queries} mask maps, got {}",
            raw.mask_logits.len_of(Axis(0))
        )));
    }

    let (width, height) = raw.original_size;
    let (w, h) = (width as f32, height as f32);
    let presence = raw.presence_logit.map(sigmoid).unwrap_or(1.0);

    let mut result = SegmentationResult::default();
    for q in 0..queries {
        let score = sigmoid(raw.logits[q]) * presence;
        if score <= threshold {
            continue;
        }

        let row = raw.boxes.row(q);
        let (cx, cy, bw, bh) = (row[0], row[1], row[2], row[3]);
        result.boxes.push([
            ((cx - bw / 2.0) * w).clamp(0.0, w),
            ((cy - bh / 2.0) * h).clamp(0.0, h),
            ((cx + bw / 2.0) * w).clamp(0.0, w),
            ((cy + bh / 2.0) * h).clamp(0.0, h),
        ]);
        result.scores.push(score);

        let logits = resize_bilinear(
            raw.mask_logits.index_axis(Axis(0), q),
            height as usize,
            width as usize,
        );
        let mask: Vec<Vec<u8>> = logits
            .outer_iter()
            .map(|line| {
                line.iter()
                    .map(|&v| u8::from(sigmoid(v) > mask_threshold))
                    .collect()
            })
            .collect();
        result.mask_shapes.push([height as usize, width as usize]);
        result.masks.push(mask);
    }
    result.num_objects = result.scores.len();
    Ok(result)
}

/// Bilinear resize with half-pixel centers (`align_corners = false`).
pub fn resize_bilinear(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    let mut out = Array2::<f32>::zeros((out_h, out_w));
    if in_h == 0 || in_w == 0 {
        return out;
    }
    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    for y in 0..out_h {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (sy.floor() as usize).min(in_h - 1);
        let y1 = (y0 + 1).min(in_h - 1);
        let wy = sy - y0 as f32;
        for x in 0..out_w {
            let sx = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (sx.floor() as usize).min(in_w - 1);
            let x1 = (x0 + 1).min(in_w - 1);
            let wx = sx - x0 as f32;

            let top = src[[y0, x0]] * (1.0 - wx) + src[[y0, x1]] * wx;
            let bottom = src[[y1, x0]] * (1.0 - wx) + src[[y1, x1]] * wx;
            out[[y, x]] = top * (1.0 - wy) + bottom * wy;
        }
    }
    out
}

/// Parses anchor spans of the form `[["+", start, end], ["-", start, end]]`
/// into `[sign, start, end]` rows where sign is `1.0` or `-1.0`.
pub fn parse_anchor_spans(value: &serde_json::Value) -> Result<Vec<[f32; 3]>, ServiceError> {
    let items = value
        .as_array()
        .ok_or_else(|| ServiceError::BadRequest("anchors must be a JSON array".into()))?;

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let bad = || {
                ServiceError::BadRequest(format!(
                    "anchor {idx} must look like [\"+\" | \"-\", start, end]"
                ))
            };
            let parts = item.as_array().filter(|p| p.len() == 3).ok_or_else(bad)?;
            let sign = match parts[0].as_str() {
                Some("+") => 1.0,
                Some("-") => -1.0,
                _ => return Err(bad()),
            };
            let start = parts[1].as_f64().ok_or_else(bad)? as f32;
            let end = parts[2].as_f64().ok_or_else(bad)? as f32;
            if end < start || start < 0.0 {
                return Err(ServiceError::BadRequest(format!(
                    "anchor {idx} has an invalid span {start}..{end}"
                )));
            }
            Ok([sign, start, end])
        })
        .collect()
}

/// Tokenizer for text prompts, read from `tokenizer.json` in the artifact
/// directory.
pub struct PromptTokenizer {
    inner: Tokenizer,
}

impl PromptTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let inner = Tokenizer::from_file(path).map_err(|e| e.to_string())?;
        Ok(Self { inner })
    }

    /// Returns `(input_ids, attention_mask)`, both `PROMPT_CONTEXT_LEN` long.
    pub fn encode(&self, prompt: &str) -> Result<(Vec<i64>, Vec<i64>), ServiceError> {
        let encoding = self
            .inner
            .encode(prompt, true)
            .map_err(|e| ServiceError::Inference(format!("tokenizer error: {e}")))?;
        Ok(pad_prompt_ids(encoding.get_ids()))
    }
}

fn pad_prompt_ids(ids: &[u32]) -> (Vec<i64>, Vec<i64>) {
    let mut input_ids: Vec<i64> = ids
        .iter()
        .take(PROMPT_CONTEXT_LEN)
        .map(|&id| id as i64)
        .collect();
    let mut mask = vec![1i64; input_ids.len()];
    input_ids.resize(PROMPT_CONTEXT_LEN, 0);
    mask.resize(PROMPT_CONTEXT_LEN, 0);
    (input_ids, mask)
}
