use std::{io::Cursor, path::Path, sync::Arc};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array1, Array2, Array3};
use serde_json::{Value, json};
use tower::ServiceExt;

use vocalx_worker::{
    AppConfig, LoadError, LoaderSet, ModelRegistry, ServiceError,
    audio::{UnavailableEncoder, WavEncoder},
    build_router,
    model::{
        Backend, BackendInfo, BackendKind, BackendLoader, InferenceInput, InferenceOutput,
        RawSegmentation, SeparatedTracks,
    },
};

const BOUNDARY: &str = "vocalx-test-boundary";

struct StubBackend(BackendKind);

impl Backend for StubBackend {
    fn describe(&self) -> BackendInfo {
        BackendInfo {
            name: self.0,
            device: "cpu".into(),
            artifact_dir: "stub".into(),
        }
    }

    fn infer(&self, input: InferenceInput) -> Result<InferenceOutput, ServiceError> {
        match input {
            InferenceInput::Segmentation(seg) => {
                let (w, h) = seg.image.dimensions();
                Ok(InferenceOutput::Segmentation(RawSegmentation {
                    logits: Array1::from(vec![5.0, -5.0]),
                    presence_logit: None,
                    boxes: Array2::from_shape_vec(
                        (2, 4),
                        vec![0.5, 0.5, 0.5, 0.5, 0.1, 0.1, 0.1, 0.1],
                    )
                    .unwrap(),
                    mask_logits: Array3::from_elem((2, 2, 2), 2.0),
                    original_size: (w, h),
                }))
            }
            InferenceInput::Separation(sep) => {
                assert!(sep.audio_path.is_file());
                Ok(InferenceOutput::Separation(SeparatedTracks {
                    sample_rate: 48_000,
                    target: vec![0.1, 0.2, 0.3],
                    residual: vec![0.0, 0.0, 0.0],
                }))
            }
        }
    }
}

/// Loads a [`StubBackend`] or fails with a fixed message.
struct StubLoader {
    kind: BackendKind,
    failure: Option<&'static str>,
}

impl BackendLoader for StubLoader {
    fn load(&self, _artifact_dir: &Path) -> Result<Arc<dyn Backend>, LoadError> {
        match self.failure {
            Some(message) => Err(LoadError::Backend {
                family: self.kind.display_name(),
                message: message.into(),
            }),
            None => Ok(Arc::new(StubBackend(self.kind))),
        }
    }
}

fn router_with(loaders: &[(BackendKind, Option<&'static str>)], wav: bool) -> Router {
    let config = Arc::new(AppConfig::with_models_root("/nonexistent/models"));
    let set = loaders.iter().fold(LoaderSet::new(), |set, &(kind, failure)| {
        set.with(kind, Arc::new(StubLoader { kind, failure }))
    });
    let registry = Arc::new(ModelRegistry::new(config.artifacts.clone(), set));
    let encoder: Arc<dyn vocalx_worker::audio::AudioEncoder> = if wav {
        Arc::new(WavEncoder)
    } else {
        Arc::new(UnavailableEncoder {
            reason: "encoder disabled".into(),
        })
    };
    build_router(config, registry, encoder)
}

fn healthy_router() -> Router {
    router_with(
        &[
            (BackendKind::Sam3, None),
            (BackendKind::Peav, None),
            (BackendKind::SamAudio, None),
        ],
        true,
    )
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, filename, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::post(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::from_pixel(width, height, Rgb([200, 10, 10]))
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

#[tokio::test]
async fn health_reports_nothing_loaded_and_resolved_paths() {
    let router = healthy_router();
    let (status, body) = send(&router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["models_loaded"], json!([]));
    assert_eq!(body["paths"]["sam3_dir"], json!("/nonexistent/models/SAM3"));
    assert_eq!(body["paths"]["peav_dir"], json!("/nonexistent/models/SAM PE AV"));
    assert_eq!(
        body["paths"]["sam_audio_dir"],
        json!("/nonexistent/models/SAM Audio")
    );
}

#[tokio::test]
async fn load_defaults_to_sam3_and_peav_and_isolates_failures() {
    let router = router_with(
        &[
            (BackendKind::Sam3, None),
            (BackendKind::Peav, Some("weights corrupted")),
            (BackendKind::SamAudio, None),
        ],
        true,
    );

    let (status, body) = send(&router, post_json("/load", "")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["loaded"], json!(["sam3"]));
    assert_eq!(body["models_loaded"], json!(["sam3"]));
    let peav = body["errors"]["peav"].as_str().unwrap();
    assert!(peav.contains("weights corrupted"), "{peav}");
    assert!(body["errors"].get("sam_audio").is_none());

    let (_, health) = send(&router, get("/health")).await;
    assert_eq!(health["models_loaded"], json!(["sam3"]));
}

#[tokio::test]
async fn load_body_overrides_query_flags() {
    let router = healthy_router();

    let request = post_json(
        "/load?load_sam3=true",
        r#"{"load_sam3": false, "load_peav": false, "load_sam_audio": true}"#,
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["loaded"], json!(["sam_audio"]));
    assert_eq!(body["errors"], json!({}));
}

#[tokio::test]
async fn load_query_flags_are_honored() {
    let router = healthy_router();
    let uri = "/load?load_sam3=false&load_peav=false&load_sam_audio=true";
    let (_, body) = send(&router, post_json(uri, "")).await;
    assert_eq!(body["models_loaded"], json!(["sam_audio"]));

    // Second call reports nothing new but keeps the loaded set.
    let (_, body) = send(&router, post_json(uri, "")).await;
    assert_eq!(body["loaded"], json!([]));
    assert_eq!(body["models_loaded"], json!(["sam_audio"]));
}

#[tokio::test]
async fn malformed_load_body_is_bad_request() {
    let router = healthy_router();
    let (status, body) = send(&router, post_json("/load", "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid load body"));
}

#[tokio::test]
async fn models_lists_loaded_backends() {
    let router = healthy_router();
    send(&router, post_json("/load", "")).await;

    let (status, body) = send(&router, get("/models")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = body["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["peav", "sam3"]);
    assert_eq!(body["models"][0]["device"], json!("cpu"));
}

#[tokio::test]
async fn segmentation_returns_instances_and_lazy_loads() {
    let router = healthy_router();
    let image = png(8, 4);

    let request = multipart(
        "/sam3/image",
        &[
            Part::File("image", "frame.png", &image),
            Part::Text("text", "a red square"),
            Part::Text("threshold", "0.4"),
        ],
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["prompt"], json!("a red square"));
    assert_eq!(body["num_objects"], json!(1));
    assert_eq!(body["mask_shapes"], json!([[4, 8]]));
    assert_eq!(body["boxes"], json!([[2.0, 1.0, 6.0, 3.0]]));
    assert_eq!(body["scores"].as_array().unwrap().len(), 1);

    let (_, health) = send(&router, get("/health")).await;
    assert_eq!(health["models_loaded"], json!(["sam3"]));
}

#[tokio::test]
async fn segmentation_is_unavailable_when_sam3_cannot_load() {
    let router = router_with(&[(BackendKind::Sam3, Some("no model.pt"))], true);
    let image = png(2, 2);

    let request = multipart(
        "/sam3/image",
        &[Part::File("image", "a.png", &image), Part::Text("text", "cat")],
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("SAM3") && message.contains("no model.pt"), "{message}");
}

#[tokio::test]
async fn segmentation_requires_image_and_text() {
    let router = healthy_router();
    let (status, body) = send(
        &router,
        multipart("/sam3/image", &[Part::Text("text", "cat")]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("image"));
}

#[tokio::test]
async fn separation_of_empty_upload_is_a_soft_failure() {
    let router = healthy_router();
    let request = multipart(
        "/sam_audio/separate",
        &[
            Part::File("audio", "empty.wav", b""),
            Part::Text("description", "drums"),
        ],
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": false, "error": "Empty upload"}));

    let (_, health) = send(&router, get("/health")).await;
    assert_eq!(health["models_loaded"], json!([]));
}

#[tokio::test]
async fn separation_returns_base64_wav_tracks() {
    let router = healthy_router();
    let request = multipart(
        "/sam_audio/separate",
        &[
            Part::File("audio", "mix.wav", b"RIFF-not-really"),
            Part::Text("description", "lead vocals"),
            Part::Text("anchors_json", r#"[["+", 0.5, 2.0]]"#),
            Part::Text("predict_spans", "false"),
            Part::Text("reranking_candidates", "0"),
        ],
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["sample_rate"], json!(48_000));
    assert!(body["target_wav_base64"].as_str().unwrap().starts_with("UklGR"));
    assert!(body["residual_wav_base64"].as_str().unwrap().starts_with("UklGR"));
}

#[tokio::test]
async fn separation_falls_back_to_raw_samples_without_encoder() {
    let router = router_with(&[(BackendKind::SamAudio, None)], false);
    let request = multipart(
        "/sam_audio/separate",
        &[
            Part::File("audio", "mix.wav", b"bytes"),
            Part::Text("description", "bass"),
        ],
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["target"].as_array().unwrap().len(), 3);
    assert!(body["warning"].as_str().unwrap().contains("encoder disabled"));
}

#[tokio::test]
async fn separation_reports_load_failure_as_unavailable() {
    let router = router_with(
        &[(BackendKind::SamAudio, Some("Insufficient RAM to load SAM-Audio"))],
        true,
    );
    let request = multipart(
        "/sam_audio/separate",
        &[Part::File("audio", "mix.wav", b"bytes")],
    );
    let (status, body) = send(&router, request).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("Insufficient RAM"));
}

#[tokio::test]
async fn separation_rejects_non_boolean_predict_spans() {
    let router = healthy_router();
    let request = multipart(
        "/sam_audio/separate",
        &[
            Part::File("audio", "mix.wav", b"bytes"),
            Part::Text("predict_spans", "sometimes"),
        ],
    );
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn load_query_accepts_numeric_and_word_booleans() {
    let router = healthy_router();
    let (status, body) = send(
        &router,
        post_json("/load?load_sam3=no&load_peav=0&load_sam_audio=1", ""),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["loaded"], json!(["sam_audio"]));
}

#[tokio::test]
async fn null_load_body_falls_back_to_query() {
    let router = healthy_router();
    let (status, body) = send(&router, post_json("/load?load_peav=off", "null")).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["loaded"], json!(["sam3"]));
}

#[tokio::test]
async fn numeric_load_body_values_are_truthy() {
    let router = healthy_router();
    let (status, body) = send(
        &router,
        post_json("/load", r#"{"load_sam3": 1, "load_peav": 0}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["loaded"], json!(["sam3"]));
}

#[tokio::test]
async fn bad_load_query_flag_is_json_bad_request() {
    let router = healthy_router();
    let (status, body) = send(&router, post_json("/load?load_sam3=maybe", "")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("load_sam3"));
}
