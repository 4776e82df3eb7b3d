use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task;
use tracing::{info, warn};

use crate::{
    config::ArtifactConfig,
    error::LoadError,
    model::{Backend, BackendInfo, BackendKind, loader::LoaderSet},
    paths::ArtifactPaths,
};

/// Outcome of a batch load; one backend failing never stops the others.
#[derive(Debug, Default, Clone, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<BackendKind>,
    pub errors: BTreeMap<BackendKind, String>,
}

impl LoadReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Lazily populated map of loaded backends.
///
/// Only successful loads are stored, and a stored handle is never replaced.
pub struct ModelRegistry {
    artifacts: ArtifactConfig,
    loaders: LoaderSet,
    loaded: RwLock<HashMap<BackendKind, Arc<dyn Backend>>>,
}

impl ModelRegistry {
    pub fn new(artifacts: ArtifactConfig, loaders: LoaderSet) -> Self {
        Self {
            artifacts,
            loaders,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves artifact directories against the current filesystem.
    pub fn paths(&self) -> ArtifactPaths {
        ArtifactPaths::resolve(&self.artifacts)
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.loaded.read().get(&kind).cloned()
    }

    pub fn loaded_names(&self) -> Vec<BackendKind> {
        let mut names: Vec<_> = self.loaded.read().keys().copied().collect();
        names.sort();
        names
    }

    pub fn describe_loaded(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<_> = self.loaded.read().values().map(|b| b.describe()).collect();
        infos.sort_by_key(|info| info.name);
        infos
    }

    pub async fn ensure_loaded(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, LoadError> {
        if let Some(existing) = self.get(kind) {
            return Ok(existing);
        }

        let loader = self.loaders.get(kind).ok_or_else(|| LoadError::Backend {
            family: kind.display_name(),
            message: "no loader registered".into(),
        })?;
        let dir = self.paths().for_backend(kind).to_path_buf();

        info!(backend = %kind, path = %dir.display(), "loading backend");
        let start = Instant::now();
        let result = task::spawn_blocking(move || loader.load(&dir))
            .await
            .map_err(|err| LoadError::Backend {
                family: kind.display_name(),
                message: format!("load task failed: {err}"),
            })
            .and_then(|r| r);

        match result {
            Ok(backend) => {
                // A racing load may have landed first; keep whichever was stored.
                let stored = self.loaded.write().entry(kind).or_insert(backend).clone();
                info!(
                    backend = %kind,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "backend ready"
                );
                Ok(stored)
            }
            Err(err) => {
                warn!(backend = %kind, error = %err, "backend failed to load");
                Err(err)
            }
        }
    }

    /// Loads every requested backend that is not loaded yet.
    pub async fn load_many(&self, kinds: &[BackendKind]) -> LoadReport {
        let mut report = LoadReport::default();
        for &kind in kinds {
            if self.get(kind).is_some() {
                continue;
            }
            match self.ensure_loaded(kind).await {
                Ok(_) => report.loaded.push(kind),
                Err(err) => {
                    report.errors.insert(kind, err.to_string());
                }
            }
        }
        report
    }
}
