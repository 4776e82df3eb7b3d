use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use crate::model::BackendKind;

pub const SAM3_DIR_VAR: &str = "VOCALX_SAM3_DIR";
pub const PEAV_DIR_VAR: &str = "VOCALX_PEAV_DIR";
pub const SAM_AUDIO_DIR_VAR: &str = "VOCALX_SAM_AUDIO_DIR";
pub const MIN_SAM_AUDIO_AVAIL_GB_VAR: &str = "VOCALX_MIN_SAM_AUDIO_AVAIL_GB";

const DEFAULT_MIN_SAM_AUDIO_AVAIL_GB: f64 = 10.0;
const DEFAULT_MAX_UPLOAD_MB: usize = 512;

/// Where model artifact directories come from.
///
/// Overrides win unconditionally; otherwise directories are derived from
/// `models_root`.
#[derive(Debug, Clone, Default)]
pub struct ArtifactConfig {
    pub models_root: PathBuf,
    pub sam3_dir: Option<PathBuf>,
    pub peav_dir: Option<PathBuf>,
    pub sam_audio_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub artifacts: ArtifactConfig,
    pub min_sam_audio_avail_gb: f64,
    pub preload: Vec<BackendKind>,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

        let models_root = non_blank_var("VOCALX_MODELS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("apps/webapp/Models"));

        let artifacts = ArtifactConfig {
            models_root,
            sam3_dir: non_blank_var(SAM3_DIR_VAR).map(PathBuf::from),
            peav_dir: non_blank_var(PEAV_DIR_VAR).map(PathBuf::from),
            sam_audio_dir: non_blank_var(SAM_AUDIO_DIR_VAR).map(PathBuf::from),
        };

        let min_sam_audio_avail_gb = min_avail_gb(non_blank_var(MIN_SAM_AUDIO_AVAIL_GB_VAR));

        let preload = non_blank_var("VOCALX_PRELOAD")
            .map(|raw| parse_backend_list(&raw))
            .unwrap_or_default();

        let max_upload_bytes = upload_limit_bytes(non_blank_var("VOCALX_MAX_UPLOAD_MB"));

        Ok(Self {
            listen_addr,
            artifacts,
            min_sam_audio_avail_gb,
            preload,
            max_upload_bytes,
        })
    }

    /// Configuration rooted at `models_root` with no overrides, used by tests
    /// and embedders that do not read the environment.
    pub fn with_models_root(models_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000),
            artifacts: ArtifactConfig {
                models_root: models_root.into(),
                ..ArtifactConfig::default()
            },
            min_sam_audio_avail_gb: DEFAULT_MIN_SAM_AUDIO_AVAIL_GB,
            preload: Vec::new(),
            max_upload_bytes: upload_limit_bytes(None),
        }
    }
}

fn non_blank_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Non-finite or negative thresholds fall back to the default.
fn min_avail_gb(raw: Option<String>) -> f64 {
    raw.and_then(|v| v.parse::<f64>().ok())
        .filter(|gb| gb.is_finite() && *gb >= 0.0)
        .unwrap_or(DEFAULT_MIN_SAM_AUDIO_AVAIL_GB)
}

fn upload_limit_bytes(raw_mb: Option<String>) -> usize {
    raw_mb
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_UPLOAD_MB)
        .saturating_mul(1024 * 1024)
}

fn parse_backend_list(raw: &str) -> Vec<BackendKind> {
    let mut kinds = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.parse::<BackendKind>() {
            Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(_) => tracing::warn!(backend = item, "ignoring unknown backend in VOCALX_PRELOAD"),
        }
    }
    kinds
}
