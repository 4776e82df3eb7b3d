use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::AppConfig,
    error::LoadError,
    guard::ResourceGuard,
    model::{Backend, BackendKind, BackendLoader},
};

#[cfg(not(feature = "tch-backend"))]
const TORCH_CAPABILITY: &str = "The TorchScript runtime (libtorch via tch)";
#[cfg(not(feature = "tch-backend"))]
const TORCH_HINT: &str = "Rebuild the worker with `--features tch-backend`, make sure libtorch \
                          is installed (or let tch download it), and restart the worker.";

/// The loader registered for each backend family.
#[derive(Clone, Default)]
pub struct LoaderSet {
    loaders: HashMap<BackendKind, Arc<dyn BackendLoader>>,
}

impl LoaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// TorchScript loaders for all three families.
    pub fn standard(config: &AppConfig, guard: ResourceGuard) -> Self {
        Self::new()
            .with(BackendKind::Sam3, Arc::new(Sam3Loader))
            .with(BackendKind::Peav, Arc::new(PeavLoader))
            .with(
                BackendKind::SamAudio,
                Arc::new(SamAudioLoader {
                    guard,
                    min_available_gb: config.min_sam_audio_avail_gb,
                }),
            )
    }

    pub fn with(mut self, kind: BackendKind, loader: Arc<dyn BackendLoader>) -> Self {
        self.loaders.insert(kind, loader);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendLoader>> {
        self.loaders.get(&kind).cloned()
    }
}

pub struct Sam3Loader;

impl BackendLoader for Sam3Loader {
    fn load(&self, artifact_dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
        let family = BackendKind::Sam3.display_name();
        require_torch_runtime()?;
        require_dir(family, artifact_dir)?;
        materialize(BackendKind::Sam3, artifact_dir)
    }
}

pub struct PeavLoader;

impl BackendLoader for PeavLoader {
    fn load(&self, artifact_dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
        let family = BackendKind::Peav.display_name();
        require_torch_runtime()?;
        require_dir(family, artifact_dir)?;
        materialize(BackendKind::Peav, artifact_dir)
    }
}

/// SAM-Audio can exceed ~8GB resident on load, so it runs the memory guard
/// before touching the weights.
pub struct SamAudioLoader {
    pub guard: ResourceGuard,
    pub min_available_gb: f64,
}

impl BackendLoader for SamAudioLoader {
    fn load(&self, artifact_dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
        let family = BackendKind::SamAudio.display_name();
        require_dir(family, artifact_dir)?;
        require_non_empty(family, artifact_dir)?;
        require_torch_runtime()?;
        self.guard.check(family, self.min_available_gb)?;
        materialize(BackendKind::SamAudio, artifact_dir)
    }
}

fn require_dir(family: &'static str, dir: &Path) -> Result<(), LoadError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(LoadError::PathMissing {
            family,
            path: dir.to_path_buf(),
        })
    }
}

fn require_non_empty(family: &'static str, dir: &Path) -> Result<(), LoadError> {
    let has_entries = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if has_entries {
        Ok(())
    } else {
        Err(LoadError::EmptyArtifact {
            family,
            path: dir.to_path_buf(),
        })
    }
}

#[cfg_attr(not(feature = "tch-backend"), allow(dead_code))]
pub(crate) fn require_file(
    family: &'static str,
    dir: &Path,
    name: &str,
) -> Result<PathBuf, LoadError> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(LoadError::ArtifactMissing { family, path })
    }
}

#[cfg(feature = "tch-backend")]
fn require_torch_runtime() -> Result<(), LoadError> {
    Ok(())
}

#[cfg(not(feature = "tch-backend"))]
fn require_torch_runtime() -> Result<(), LoadError> {
    Err(LoadError::CapabilityMissing {
        capability: TORCH_CAPABILITY,
        hint: TORCH_HINT,
    })
}

#[cfg(feature = "tch-backend")]
fn materialize(kind: BackendKind, dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
    tracing::info!(backend = %kind, path = %dir.display(), "materializing TorchScript backend");
    match kind {
        BackendKind::Sam3 => crate::model::torch::load_sam3(dir),
        BackendKind::Peav => crate::model::torch::load_peav(dir),
        BackendKind::SamAudio => crate::model::torch::load_sam_audio(dir),
    }
}

#[cfg(not(feature = "tch-backend"))]
fn materialize(_kind: BackendKind, _dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
    Err(LoadError::CapabilityMissing {
        capability: TORCH_CAPABILITY,
        hint: TORCH_HINT,
    })
}
