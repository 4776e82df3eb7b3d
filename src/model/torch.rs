//! TorchScript implementations of the three backend families.
//!
//! Each artifact directory holds a traced `model.pt`; the text-conditioned
//! families also carry `tokenizer.json`. Module signatures:
//!
//! * SAM3: `forward(pixel_values[1,3,S,S], input_ids[1,T], attention_mask[1,T])
//!   -> (pred_logits[1,Q], pred_boxes[1,Q,4], pred_masks[1,Q,h,w], presence_logits[1,1])`.
//!   The presence output is optional.
//! * SAM-Audio: `forward(audio[1,N], input_ids[1,T], attention_mask[1,T],
//!   anchors[1,A,3], predict_spans: bool, reranking_candidates: int)
//!   -> (target[1,N'], residual[1,N'])`.
//! * PE-AV: loaded and kept resident; no request path consumes it yet.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use ndarray::{Array1, Array2, Array3};
use parking_lot::Mutex;
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};

use crate::{
    audio,
    error::{LoadError, ServiceError},
    model::{
        Backend, BackendInfo, BackendKind, ExecutionDevice, InferenceInput, InferenceOutput,
        RawSegmentation, SegmentationInput, SeparatedTracks, SeparationInput,
        loader::require_file,
        processor::{self, PromptTokenizer, SAM3_IMAGE_SIZE},
        unsupported,
    },
};

const MODULE_FILE: &str = "model.pt";
const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 16_000;

fn select_device() -> Device {
    if tch::Cuda::is_available() {
        Device::Cuda(0)
    } else {
        Device::Cpu
    }
}

fn execution_device(device: Device) -> ExecutionDevice {
    match device {
        Device::Cuda(idx) => ExecutionDevice::Cuda(idx),
        _ => ExecutionDevice::Cpu,
    }
}

fn load_module(family: &'static str, dir: &Path, device: Device) -> Result<CModule, LoadError> {
    let path = require_file(family, dir, MODULE_FILE)?;
    let mut module = CModule::load_on_device(&path, device).map_err(|e| LoadError::Backend {
        family,
        message: e.to_string(),
    })?;
    module.set_eval();
    Ok(module)
}

fn load_tokenizer(family: &'static str, dir: &Path) -> Result<PromptTokenizer, LoadError> {
    let path = require_file(family, dir, TOKENIZER_FILE)?;
    PromptTokenizer::from_file(&path).map_err(|message| LoadError::Backend { family, message })
}

fn prompt_tensors(
    tokenizer: &PromptTokenizer,
    prompt: &str,
    device: Device,
) -> Result<(Tensor, Tensor), ServiceError> {
    let (ids, mask) = tokenizer.encode(prompt)?;
    let len = ids.len() as i64;
    Ok((
        Tensor::from_slice(&ids).reshape([1, len]).to_device(device),
        Tensor::from_slice(&mask).reshape([1, len]).to_device(device),
    ))
}

fn output_tensors(output: IValue, min_len: usize) -> Result<Vec<Tensor>, ServiceError> {
    let items = match output {
        IValue::Tuple(items) | IValue::GenericList(items) => items,
        IValue::Tensor(t) => vec![IValue::Tensor(t)],
        _ => return Err(ServiceError::Inference("unexpected model output format".into())),
    };
    let tensors: Vec<Tensor> = items
        .into_iter()
        .filter_map(|item| match item {
            IValue::Tensor(t) => Some(t),
            _ => None,
        })
        .collect();
    if tensors.len() < min_len {
        return Err(ServiceError::Inference(format!(
            "expected at least {min_len} output tensors, got {}",
            tensors.len()
        )));
    }
    Ok(tensors)
}

fn to_vec_f32(tensor: &Tensor) -> Result<Vec<f32>, ServiceError> {
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .flatten(0, -1);
    Vec::<f32>::try_from(&flat).map_err(|e| ServiceError::Inference(e.to_string()))
}

fn dims(tensor: &Tensor) -> Vec<usize> {
    tensor.size().into_iter().map(|d| d.max(0) as usize).collect()
}

fn shape_error(what: &str, shape: &[usize]) -> ServiceError {
    ServiceError::Inference(format!("unexpected {what} shape {shape:?}"))
}

pub struct Sam3Backend {
    dir: PathBuf,
    device: Device,
    module: Mutex<CModule>,
    tokenizer: PromptTokenizer,
}

pub fn load_sam3(dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
    let family = BackendKind::Sam3.display_name();
    let device = select_device();
    let module = load_module(family, dir, device)?;
    let tokenizer = load_tokenizer(family, dir)?;
    Ok(Arc::new(Sam3Backend {
        dir: dir.to_path_buf(),
        device,
        module: Mutex::new(module),
        tokenizer,
    }))
}

impl Sam3Backend {
    fn segment(&self, input: SegmentationInput) -> Result<RawSegmentation, ServiceError> {
        let original_size = input.image.dimensions();
        let side = SAM3_IMAGE_SIZE as i64;
        let pixels: Vec<f32> = processor::image_to_chw(&input.image, SAM3_IMAGE_SIZE)
            .iter()
            .copied()
            .collect();
        let pixel_values = Tensor::from_slice(&pixels)
            .reshape([1, 3, side, side])
            .to_device(self.device);
        let (input_ids, attention_mask) =
            prompt_tensors(&self.tokenizer, &input.prompt, self.device)?;

        let outputs = no_grad(|| {
            let module = self.module.lock();
            module
                .forward_is(&[
                    IValue::Tensor(pixel_values),
                    IValue::Tensor(input_ids),
                    IValue::Tensor(attention_mask),
                ])
                .map_err(|e| ServiceError::Inference(e.to_string()))
        })?;
        let tensors = output_tensors(outputs, 3)?;

        let mask_dims = dims(&tensors[2]);
        let [_, queries, mask_h, mask_w] = mask_dims[..] else {
            return Err(shape_error("pred_masks", &mask_dims));
        };
        let logits = Array1::from(to_vec_f32(&tensors[0])?);
        let boxes = Array2::from_shape_vec((queries, 4), to_vec_f32(&tensors[1])?)
            .map_err(|_| shape_error("pred_boxes", &dims(&tensors[1])))?;
        let mask_logits =
            Array3::from_shape_vec((queries, mask_h, mask_w), to_vec_f32(&tensors[2])?)
                .map_err(|_| shape_error("pred_masks", &mask_dims))?;
        let presence_logit = match tensors.get(3) {
            Some(t) => to_vec_f32(t)?.first().copied(),
            None => None,
        };

        Ok(RawSegmentation {
            logits,
            presence_logit,
            boxes,
            mask_logits,
            original_size,
        })
    }
}

impl Backend for Sam3Backend {
    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: BackendKind::Sam3,
            device: execution_device(self.device).to_string(),
            artifact_dir: self.dir.clone(),
        }
    }

    fn infer(&self, input: InferenceInput) -> Result<InferenceOutput, ServiceError> {
        match input {
            InferenceInput::Segmentation(input) => {
                self.segment(input).map(InferenceOutput::Segmentation)
            }
            other => Err(unsupported(&self.describe(), &other)),
        }
    }
}

pub struct SamAudioBackend {
    dir: PathBuf,
    device: Device,
    module: Mutex<CModule>,
    tokenizer: PromptTokenizer,
    sample_rate: u32,
}

pub fn load_sam_audio(dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
    let family = BackendKind::SamAudio.display_name();
    let device = select_device();
    let module = load_module(family, dir, device)?;
    let tokenizer = load_tokenizer(family, dir)?;
    Ok(Arc::new(SamAudioBackend {
        dir: dir.to_path_buf(),
        device,
        module: Mutex::new(module),
        tokenizer,
        sample_rate: read_sample_rate(dir),
    }))
}

fn read_sample_rate(dir: &Path) -> u32 {
    fs::read_to_string(dir.join(CONFIG_FILE))
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|config| config.get("audio_sampling_rate")?.as_u64())
        .and_then(|rate| u32::try_from(rate).ok())
        .unwrap_or(DEFAULT_AUDIO_SAMPLE_RATE)
}

impl SamAudioBackend {
    fn separate(&self, input: SeparationInput) -> Result<SeparatedTracks, ServiceError> {
        let (samples, rate) = audio::decode_audio_file(&input.audio_path)
            .map_err(|e| ServiceError::BadRequest(format!("could not decode audio upload: {e}")))?;
        let samples = audio::resample_linear(&samples, rate, self.sample_rate);
        let audio = Tensor::from_slice(&samples)
            .reshape([1, samples.len() as i64])
            .to_device(self.device);

        let (input_ids, attention_mask) =
            prompt_tensors(&self.tokenizer, &input.description, self.device)?;

        let spans = match input.anchors.as_ref() {
            Some(value) => processor::parse_anchor_spans(value)?,
            None => Vec::new(),
        };
        let flat: Vec<f32> = spans.iter().flatten().copied().collect();
        let anchors = Tensor::from_slice(&flat)
            .reshape([1, spans.len() as i64, 3])
            .to_device(self.device);
        let reranking = input.reranking_candidates.unwrap_or(0) as i64;

        let outputs = no_grad(|| {
            let module = self.module.lock();
            module
                .forward_is(&[
                    IValue::Tensor(audio),
                    IValue::Tensor(input_ids),
                    IValue::Tensor(attention_mask),
                    IValue::Tensor(anchors),
                    IValue::Bool(input.predict_spans),
                    IValue::Int(reranking),
                ])
                .map_err(|e| ServiceError::Inference(e.to_string()))
        })?;
        let tensors = output_tensors(outputs, 2)?;

        Ok(SeparatedTracks {
            sample_rate: self.sample_rate,
            target: to_vec_f32(&tensors[0])?,
            residual: to_vec_f32(&tensors[1])?,
        })
    }
}

impl Backend for SamAudioBackend {
    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: BackendKind::SamAudio,
            device: execution_device(self.device).to_string(),
            artifact_dir: self.dir.clone(),
        }
    }

    fn infer(&self, input: InferenceInput) -> Result<InferenceOutput, ServiceError> {
        match input {
            InferenceInput::Separation(input) => {
                self.separate(input).map(InferenceOutput::Separation)
            }
            other => Err(unsupported(&self.describe(), &other)),
        }
    }
}

pub struct PeavBackend {
    dir: PathBuf,
    device: Device,
    _module: Mutex<CModule>,
}

pub fn load_peav(dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
    let family = BackendKind::Peav.display_name();
    let device = select_device();
    let module = load_module(family, dir, device)?;
    Ok(Arc::new(PeavBackend {
        dir: dir.to_path_buf(),
        device,
        _module: Mutex::new(module),
    }))
}

impl Backend for PeavBackend {
    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: BackendKind::Peav,
            device: execution_device(self.device).to_string(),
            artifact_dir: self.dir.clone(),
        }
    }

    fn infer(&self, input: InferenceInput) -> Result<InferenceOutput, ServiceError> {
        Err(unsupported(&self.describe(), &input))
    }
}
