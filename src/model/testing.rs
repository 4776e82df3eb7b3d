use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    config::ArtifactConfig,
    error::{LoadError, ServiceError},
    model::{
        Backend, BackendInfo, BackendKind, BackendLoader, InferenceInput, InferenceOutput,
        LoaderSet, ModelRegistry, RawSegmentation, SeparatedTracks, unsupported,
    },
};

pub(crate) enum Scripted {
    Segmentation(RawSegmentation),
    Separation(SeparatedTracks),
    Fail(String),
    Nothing,
}

#[derive(Debug, Clone)]
pub(crate) enum Seen {
    Segmentation {
        prompt: String,
        size: (u32, u32),
    },
    Separation {
        audio_path: PathBuf,
        existed: bool,
        bytes: Vec<u8>,
        description: String,
        anchors: Option<serde_json::Value>,
        reranking_candidates: Option<u32>,
        predict_spans: bool,
    },
}

pub(crate) struct FakeBackend {
    kind: BackendKind,
    script: Scripted,
    pub seen: Mutex<Vec<Seen>>,
}

impl FakeBackend {
    pub(crate) fn new(kind: BackendKind, script: Scripted) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl Backend for FakeBackend {
    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: self.kind,
            device: "cpu".into(),
            artifact_dir: "fake".into(),
        }
    }

    fn infer(&self, input: InferenceInput) -> Result<InferenceOutput, ServiceError> {
        match &input {
            InferenceInput::Segmentation(seg) => self.seen.lock().push(Seen::Segmentation {
                prompt: seg.prompt.clone(),
                size: seg.image.dimensions(),
            }),
            InferenceInput::Separation(sep) => self.seen.lock().push(Seen::Separation {
                audio_path: sep.audio_path.clone(),
                existed: sep.audio_path.is_file(),
                bytes: std::fs::read(&sep.audio_path).unwrap_or_default(),
                description: sep.description.clone(),
                anchors: sep.anchors.clone(),
                reranking_candidates: sep.reranking_candidates,
                predict_spans: sep.predict_spans,
            }),
        }

        match (&self.script, &input) {
            (Scripted::Segmentation(raw), InferenceInput::Segmentation(_)) => {
                Ok(InferenceOutput::Segmentation(raw.clone()))
            }
            (Scripted::Separation(tracks), InferenceInput::Separation(_)) => {
                Ok(InferenceOutput::Separation(tracks.clone()))
            }
            (Scripted::Fail(message), _) => Err(ServiceError::Inference(message.clone())),
            _ => Err(unsupported(&self.describe(), &input)),
        }
    }
}

type Factory = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

/// Fails the first `failures` loads, then hands out backends from `make`.
pub(crate) struct FakeLoader {
    kind: BackendKind,
    failures: usize,
    calls: AtomicUsize,
    make: Factory,
}

impl FakeLoader {
    pub(crate) fn stub(kind: BackendKind, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failures,
            calls: AtomicUsize::new(0),
            make: Box::new(move || FakeBackend::new(kind, Scripted::Nothing) as Arc<dyn Backend>),
        })
    }

    pub(crate) fn serving(backend: Arc<FakeBackend>) -> Arc<Self> {
        let kind = backend.kind;
        Arc::new(Self {
            kind,
            failures: 0,
            calls: AtomicUsize::new(0),
            make: Box::new(move || backend.clone() as Arc<dyn Backend>),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BackendLoader for FakeLoader {
    fn load(&self, artifact_dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(LoadError::PathMissing {
                family: self.kind.display_name(),
                path: artifact_dir.to_path_buf(),
            });
        }
        Ok((self.make)())
    }
}

pub(crate) fn registry_with(loaders: &[Arc<FakeLoader>]) -> ModelRegistry {
    let set = loaders
        .iter()
        .fold(LoaderSet::new(), |set, loader| set.with(loader.kind, loader.clone()));
    ModelRegistry::new(
        ArtifactConfig {
            models_root: "models".into(),
            ..ArtifactConfig::default()
        },
        set,
    )
}
