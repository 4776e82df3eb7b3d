use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, Query, State,
        multipart::{Field, MultipartError},
        rejection::QueryRejection,
    },
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    audio::AudioEncoder,
    config::AppConfig,
    error::ServiceError,
    model::{BackendInfo, BackendKind, ModelRegistry},
    paths::ArtifactPaths,
    segmentation::{self, SegmentationRequest, SegmentationResponse},
    separation::{self, SeparationRequest, SeparationResponse},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub encoder: Arc<dyn AudioEncoder>,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    models_loaded: Vec<BackendKind>,
    paths: ArtifactPaths,
}

#[derive(Serialize)]
struct LoadResponse {
    ok: bool,
    loaded: Vec<BackendKind>,
    errors: BTreeMap<BackendKind, String>,
    models_loaded: Vec<BackendKind>,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<BackendInfo>,
}

/// `/load` flags with their defaults. Query values are parsed like form
/// booleans; JSON body values override them key by key.
const LOAD_FLAGS: [(BackendKind, &str, bool); 3] = [
    (BackendKind::Sam3, "load_sam3", true),
    (BackendKind::Peav, "load_peav", true),
    (BackendKind::SamAudio, "load_sam_audio", false),
];

fn requested_backends(
    query: &HashMap<String, String>,
    body: &Map<String, Value>,
) -> Result<Vec<BackendKind>, ServiceError> {
    let mut requested = Vec::new();
    for (kind, key, default) in LOAD_FLAGS {
        let wanted = match (body.get(key), query.get(key)) {
            (Some(value), _) => json_truthy(value, key)?,
            (None, Some(raw)) => parse_form_bool(raw, key)?,
            (None, None) => default,
        };
        if wanted {
            requested.push(kind);
        }
    }
    Ok(requested)
}

/// Blank, `null` and `{}` bodies all mean "query flags only".
fn parse_load_body(body: &[u8]) -> Result<Map<String, Value>, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid load body: {e}")))?;
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(ServiceError::BadRequest(format!(
            "invalid load body: expected a JSON object, got {other}"
        ))),
    }
}

fn json_truthy(value: &Value, key: &str) -> Result<bool, ServiceError> {
    Ok(match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(raw) => parse_form_bool(raw, key)?,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    })
}

pub fn build_router(
    config: Arc<AppConfig>,
    registry: Arc<ModelRegistry>,
    encoder: Arc<dyn AudioEncoder>,
) -> Router {
    let body_limit = config.max_upload_bytes;
    let state = AppState {
        config,
        registry,
        encoder,
    };

    Router::new()
        .route("/health", get(health))
        .route("/load", post(load_models))
        .route("/models", get(models))
        .route("/sam3/image", post(sam3_image))
        .route("/sam_audio/separate", post(sam_audio_separate))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        models_loaded: state.registry.loaded_names(),
        paths: state.registry.paths(),
    })
}

async fn load_models(
    State(state): State<AppState>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
    body: Bytes,
) -> Result<Json<LoadResponse>, ServiceError> {
    let Query(query) = query.map_err(|e| ServiceError::BadRequest(e.body_text()))?;
    let body = parse_load_body(&body)?;
    let requested = requested_backends(&query, &body)?;

    info!(?requested, "load requested");
    let report = state.registry.load_many(&requested).await;

    Ok(Json(LoadResponse {
        ok: report.ok(),
        loaded: report.loaded,
        errors: report.errors,
        models_loaded: state.registry.loaded_names(),
    }))
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.registry.describe_loaded(),
    })
}

async fn sam3_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SegmentationResponse>, ServiceError> {
    let mut image = None;
    let mut prompt = None;
    let mut threshold = segmentation::DEFAULT_THRESHOLD;
    let mut mask_threshold = segmentation::DEFAULT_MASK_THRESHOLD;

    while let Some(field) = next_field(&mut multipart).await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => image = Some(field_bytes(field, &name).await?.to_vec()),
            "text" => prompt = Some(field_text(field, &name).await?),
            "threshold" => threshold = parse_field(&field_text(field, &name).await?, &name)?,
            "mask_threshold" => {
                mask_threshold = parse_field(&field_text(field, &name).await?, &name)?
            }
            _ => {}
        }
    }

    let request = SegmentationRequest {
        image: image.ok_or_else(|| missing("image"))?,
        prompt: prompt.ok_or_else(|| missing("text"))?,
        threshold,
        mask_threshold,
    };
    info!(
        bytes = request.image.len(),
        prompt = %request.prompt,
        "segmentation request"
    );

    let response = segmentation::segment(&state.registry, request).await?;
    Ok(Json(response))
}

async fn sam_audio_separate(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SeparationResponse>, ServiceError> {
    let mut audio = None;
    let mut request = SeparationRequest::default();

    while let Some(field) = next_field(&mut multipart).await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio" => {
                request.filename = field.file_name().map(str::to_string);
                audio = Some(field_bytes(field, &name).await?.to_vec());
            }
            "description" => request.description = field_text(field, &name).await?,
            "anchors_json" => request.anchors_json = field_text(field, &name).await?,
            "reranking_candidates" => {
                request.reranking_candidates = parse_field(&field_text(field, &name).await?, &name)?
            }
            "predict_spans" => {
                request.predict_spans = parse_form_bool(&field_text(field, &name).await?, &name)?
            }
            _ => {}
        }
    }
    request.audio = audio.ok_or_else(|| missing("audio"))?;
    info!(
        bytes = request.audio.len(),
        filename = request.filename.as_deref().unwrap_or(""),
        "separation request"
    );

    let response = separation::separate(&state.registry, state.encoder.clone(), request).await?;
    Ok(Json(response))
}

async fn next_field(multipart: &mut Multipart) -> Result<Option<Field<'_>>, ServiceError> {
    multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadRequest(format!("failed reading multipart field: {e}")))
}

async fn field_bytes(field: Field<'_>, name: &str) -> Result<Bytes, ServiceError> {
    field
        .bytes()
        .await
        .map_err(|e| field_error(name, e))
}

async fn field_text(field: Field<'_>, name: &str) -> Result<String, ServiceError> {
    field
        .text()
        .await
        .map_err(|e| field_error(name, e))
}

fn field_error(name: &str, err: MultipartError) -> ServiceError {
    ServiceError::BadRequest(format!("failed reading multipart '{name}' field: {err}"))
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, ServiceError> {
    raw.trim()
        .parse()
        .map_err(|_| ServiceError::BadRequest(format!("'{name}' has an invalid value: {raw:?}")))
}

fn parse_form_bool(raw: &str, name: &str) -> Result<bool, ServiceError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ServiceError::BadRequest(format!(
            "'{name}' must be a boolean, got {raw:?}"
        ))),
    }
}

fn missing(name: &str) -> ServiceError {
    ServiceError::BadRequest(format!("missing multipart field '{name}'"))
}
