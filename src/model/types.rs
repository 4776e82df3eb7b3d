use std::{fmt, path::PathBuf, str::FromStr};

use image::RgbImage;
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

/// The three backend families the worker knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Peav,
    Sam3,
    SamAudio,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Sam3, BackendKind::Peav, BackendKind::SamAudio];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sam3 => "sam3",
            BackendKind::Peav => "peav",
            BackendKind::SamAudio => "sam_audio",
        }
    }

    /// Human-facing family name used in load diagnostics.
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Sam3 => "SAM3",
            BackendKind::Peav => "PE-AV",
            BackendKind::SamAudio => "SAM-Audio",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sam3" => Ok(BackendKind::Sam3),
            "peav" => Ok(BackendKind::Peav),
            "sam_audio" => Ok(BackendKind::SamAudio),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDevice {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionDevice::Cpu => f.write_str("cpu"),
            ExecutionDevice::Cuda(0) => f.write_str("cuda"),
            ExecutionDevice::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: BackendKind,
    pub device: String,
    pub artifact_dir: PathBuf,
}

pub struct SegmentationInput {
    pub image: RgbImage,
    pub prompt: String,
}

pub struct SeparationInput {
    pub audio_path: PathBuf,
    pub description: String,
    pub anchors: Option<serde_json::Value>,
    pub reranking_candidates: Option<u32>,
    pub predict_spans: bool,
}

pub enum InferenceInput {
    Segmentation(SegmentationInput),
    Separation(SeparationInput),
}

impl InferenceInput {
    pub fn task(&self) -> &'static str {
        match self {
            InferenceInput::Segmentation(_) => "segmentation",
            InferenceInput::Separation(_) => "separation",
        }
    }
}

/// Unprocessed detector output for a single image.
///
/// `boxes` rows are normalized `(cx, cy, w, h)`; `mask_logits` holds one
/// low-resolution logit map per query.
#[derive(Debug, Clone)]
pub struct RawSegmentation {
    pub logits: Array1<f32>,
    pub presence_logit: Option<f32>,
    pub boxes: Array2<f32>,
    pub mask_logits: Array3<f32>,
    pub original_size: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct SeparatedTracks {
    pub sample_rate: u32,
    pub target: Vec<f32>,
    pub residual: Vec<f32>,
}

pub enum InferenceOutput {
    Segmentation(RawSegmentation),
    Separation(SeparatedTracks),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_sort_alphabetically() {
        let mut kinds = BackendKind::ALL.to_vec();
        kinds.sort();
        let names: Vec<_> = kinds.iter().map(BackendKind::as_str).collect();
        assert_eq!(names, vec!["peav", "sam3", "sam_audio"]);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("sam2".parse::<BackendKind>().is_err());
    }

    #[test]
    fn device_display() {
        assert_eq!(ExecutionDevice::Cpu.to_string(), "cpu");
        assert_eq!(ExecutionDevice::Cuda(0).to_string(), "cuda");
        assert_eq!(ExecutionDevice::Cuda(1).to_string(), "cuda:1");
    }
}
