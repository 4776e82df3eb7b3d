use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{config::ArtifactConfig, model::BackendKind};

const SAM3_DIR_NAME: &str = "SAM3";
const PEAV_DIR_NAME: &str = "SAM PE AV";
const PEAV_LEGACY_DIR_NAME: &str = "SAM";
const SAM_AUDIO_DIR_NAME: &str = "SAM Audio";

/// Resolved artifact directories, one per backend family.
///
/// Resolved fresh on every health check and load so that a fixed directory
/// layout is picked up without a restart. A path may not exist; loaders report
/// that with the path in the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    pub sam3_dir: PathBuf,
    pub peav_dir: PathBuf,
    pub sam_audio_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn resolve(config: &ArtifactConfig) -> Self {
        let root = config.models_root.as_path();

        let default_peav = root.join(PEAV_DIR_NAME);
        let peav_dir = config.peav_dir.clone().unwrap_or_else(|| {
            first_existing_dir(&[default_peav.clone(), root.join(PEAV_LEGACY_DIR_NAME)])
                .unwrap_or(default_peav)
        });

        Self {
            sam3_dir: config
                .sam3_dir
                .clone()
                .unwrap_or_else(|| root.join(SAM3_DIR_NAME)),
            peav_dir,
            sam_audio_dir: config
                .sam_audio_dir
                .clone()
                .unwrap_or_else(|| root.join(SAM_AUDIO_DIR_NAME)),
        }
    }

    pub fn for_backend(&self, kind: BackendKind) -> &Path {
        match kind {
            BackendKind::Sam3 => &self.sam3_dir,
            BackendKind::Peav => &self.peav_dir,
            BackendKind::SamAudio => &self.sam_audio_dir,
        }
    }
}

fn first_existing_dir(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_dir()).cloned()
}
