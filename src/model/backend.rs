use std::{path::Path, sync::Arc};

use crate::{
    error::{LoadError, ServiceError},
    model::{BackendInfo, InferenceInput, InferenceOutput},
};

/// A loaded model together with its preprocessor and execution device.
///
/// Handles are shared read-only across requests; implementations guard any
/// interior mutability themselves.
pub trait Backend: Send + Sync {
    fn describe(&self) -> BackendInfo;

    /// Runs one blocking inference call.
    fn infer(&self, input: InferenceInput) -> Result<InferenceOutput, ServiceError>;
}

/// Materializes a [`Backend`] from an artifact directory.
pub trait BackendLoader: Send + Sync {
    fn load(&self, artifact_dir: &Path) -> Result<Arc<dyn Backend>, LoadError>;
}

#[cfg(any(feature = "tch-backend", test))]
pub(crate) fn unsupported(info: &BackendInfo, input: &InferenceInput) -> ServiceError {
    ServiceError::BadRequest(format!(
        "backend {} does not support {} requests",
        info.name,
        input.task()
    ))
}
