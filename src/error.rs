use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::guard::ResourceError;

/// Why a backend could not be loaded. Never cached; the next request retries.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("{capability} is not available in this build. {hint}")]
    CapabilityMissing {
        capability: &'static str,
        hint: &'static str,
    },
    #[error("{family} model directory not found: {}", .path.display())]
    PathMissing { family: &'static str, path: PathBuf },
    #[error(
        "{family} model directory is empty: {}. Please put the checkpoint files here \
         (model.pt, tokenizer.json and config files).",
        .path.display()
    )]
    EmptyArtifact { family: &'static str, path: PathBuf },
    #[error("{family} artifact missing: {}", .path.display())]
    ArtifactMissing { family: &'static str, path: PathBuf },
    #[error(transparent)]
    InsufficientResources(#[from] ResourceError),
    #[error("{family} failed to load: {message}")]
    Backend {
        family: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BackendUnavailable(#[from] LoadError),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Inference(_) | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
