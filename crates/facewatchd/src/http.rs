//! HTTP surface: MJPEG stream, result queries, enrollment and store control.

use crate::enroll::{EnrollRequest, Enroller};
use crate::pipeline::PipelineState;
use crate::state::SharedFrameState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use facewatch_core::{BoundingBox, ReferenceStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub const STREAM_BOUNDARY: &str = "frame";
const MAX_ENROLL_FRAMES: usize = 64;
const MAX_ENROLL_INTERVAL_SECS: f64 = 10.0;

/// Enrollment parameters used when a request omits them.
#[derive(Debug, Clone, Copy)]
pub struct EnrollDefaults {
    pub frames: usize,
    pub interval: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub frame_state: Arc<SharedFrameState>,
    pub store: Arc<ReferenceStore>,
    pub enroller: Arc<Enroller>,
    pub frames: watch::Receiver<Option<Bytes>>,
    pub pipeline: watch::Receiver<PipelineState>,
    pub camera_id: Arc<str>,
    pub enroll_defaults: EnrollDefaults,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/video_feed/{camera_id}", get(video_feed))
        .route("/api/unknown_faces", get(unknown_faces))
        .route("/api/faces", get(faces))
        .route("/api/add_face", post(add_face))
        .route("/api/people", get(people))
        .route("/api/reload", post(reload))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "ok": false, "error": message.into() }))).into_response()
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let head = format!("--{STREAM_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn video_feed(State(app): State<AppState>, Path(camera_id): Path<String>) -> Response {
    if camera_id != *app.camera_id {
        return error(StatusCode::NOT_FOUND, format!("unknown camera {camera_id:?}"));
    }

    let frames = app.frames.clone();
    if *app.pipeline.borrow() == PipelineState::Terminated && frames.borrow().is_none() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "camera stream unavailable");
    }

    tracing::info!(camera = %camera_id, "stream client connected");

    // Only the newest frame is ever delivered; a slow client skips ahead.
    let stream = futures::stream::unfold(frames, |mut rx| async move {
        loop {
            rx.changed().await.ok()?;
            let latest = rx.borrow_and_update().clone();
            if let Some(jpeg) = latest {
                return Some((Ok::<_, Infallible>(multipart_part(&jpeg)), rx));
            }
        }
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct UnknownFace {
    bbox: BoundingBox,
    score: f32,
}

async fn unknown_faces(State(app): State<AppState>) -> Json<Vec<UnknownFace>> {
    let unknown = app
        .frame_state
        .unknown_faces()
        .into_iter()
        .map(|f| UnknownFace {
            bbox: f.bbox,
            score: f.score,
        })
        .collect();
    Json(unknown)
}

async fn faces(State(app): State<AppState>) -> Response {
    Json(app.frame_state.latest_results()).into_response()
}

#[derive(Debug, Deserialize)]
struct AddFaceBody {
    name: Option<String>,
    /// `[x1, y1, x2, y2]`; fractional coordinates are rounded outward.
    bbox: Option<[f64; 4]>,
    #[serde(rename = "frameCount", alias = "num_frames")]
    frame_count: Option<usize>,
    /// Seconds between samples.
    interval: Option<f64>,
}

/// The body is parsed as JSON whatever its `Content-Type`.
async fn add_face(State(app): State<AppState>, raw: Bytes) -> Response {
    let body: AddFaceBody = match serde_json::from_slice(&raw) {
        Ok(body) => body,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")),
    };
    let name = match body.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return error(StatusCode::BAD_REQUEST, "missing name"),
    };
    let Some([x1, y1, x2, y2]) = body.bbox else {
        return error(StatusCode::BAD_REQUEST, "missing bbox");
    };
    if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
        return error(StatusCode::BAD_REQUEST, "bbox must be finite");
    }

    let frame_count = body.frame_count.unwrap_or(app.enroll_defaults.frames);
    if frame_count > MAX_ENROLL_FRAMES {
        return error(
            StatusCode::BAD_REQUEST,
            format!("frameCount must be at most {MAX_ENROLL_FRAMES}"),
        );
    }
    let interval = match body.interval {
        None => app.enroll_defaults.interval,
        Some(secs) if (0.0..=MAX_ENROLL_INTERVAL_SECS).contains(&secs) => {
            Duration::from_secs_f64(secs)
        }
        Some(_) => {
            return error(
                StatusCode::BAD_REQUEST,
                format!("interval must be between 0 and {MAX_ENROLL_INTERVAL_SECS} seconds"),
            )
        }
    };

    let request = EnrollRequest {
        name,
        bbox: BoundingBox::from_f32(x1 as f32, y1 as f32, x2 as f32, y2 as f32),
        frame_count,
        interval,
    };
    match app.enroller.enroll(request).await {
        Ok(outcome) => {
            Json(json!({ "ok": outcome.saved > 0, "saved": outcome.saved })).into_response()
        }
        Err(e) => error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn people(State(app): State<AppState>) -> Response {
    Json(json!({
        "generation": app.store.generation(),
        "persons": app.store.summary(),
    }))
    .into_response()
}

async fn reload(State(app): State<AppState>) -> Response {
    let store = app.store.clone();
    match tokio::task::spawn_blocking(move || store.reload()).await {
        Ok(Ok(summary)) => Json(json!({
            "ok": true,
            "generation": summary.generation,
            "report": summary.report,
        }))
        .into_response(),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "ok": false,
                "error": e.to_string(),
                "generation": app.store.generation(),
                "persons": app.store.summary(),
            })),
        )
            .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("reload task failed: {e}")),
    }
}

async fn health(State(app): State<AppState>) -> Response {
    let state = *app.pipeline.borrow();
    let gallery = app.store.snapshot();
    Json(json!({
        "pipeline": state,
        "generation": app.store.generation(),
        "persons": gallery.len(),
        "embeddings": gallery.embedding_count(),
        "frames_published": app.frame_state.published(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReloadMode;
    use crate::testutil;
    use axum::http::Request;
    use facewatch_core::{FaceResult, MatchResult};
    use image::{Rgb, RgbImage};
    use serde_json::Value;
    use tower::ServiceExt;

    struct Rig {
        app: AppState,
        frames_tx: watch::Sender<Option<Bytes>>,
        status_tx: watch::Sender<PipelineState>,
        dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = testutil::loaded_store(dir.path());
        let frame_state = Arc::new(SharedFrameState::new());
        let enroller = Arc::new(Enroller::new(
            frame_state.clone(),
            store.clone(),
            dir.path(),
            ReloadMode::Batched,
        ));
        let (frames_tx, frames) = watch::channel(None);
        let (status_tx, pipeline) = watch::channel(PipelineState::Streaming);
        Rig {
            app: AppState {
                frame_state,
                store,
                enroller,
                frames,
                pipeline,
                camera_id: Arc::from("cam1"),
                enroll_defaults: EnrollDefaults {
                    frames: 2,
                    interval: Duration::ZERO,
                },
            },
            frames_tx,
            status_tx,
            dir,
        }
    }

    async fn send(app: &AppState, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = router(app.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    async fn get_json(app: &AppState, uri: &str) -> (StatusCode, Value) {
        let (status, body) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: &AppState, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn publish_results(app: &AppState) {
        let known = FaceResult::new(
            BoundingBox::new(1, 2, 30, 40),
            MatchResult {
                label: "alice".into(),
                score: 0.91,
            },
        );
        let unknown = FaceResult::new(BoundingBox::new(50, 60, 70, 80), MatchResult::unknown(0.25));
        app.frame_state.publish(
            Arc::new(RgbImage::from_pixel(100, 100, Rgb(testutil::RED))),
            vec![known, unknown],
        );
    }

    #[tokio::test]
    async fn test_unknown_faces() {
        let rig = rig();
        let (status, body) = get_json(&rig.app, "/api/unknown_faces").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        publish_results(&rig.app);
        let (_, body) = get_json(&rig.app, "/api/unknown_faces").await;
        assert_eq!(body, json!([{ "bbox": [50, 60, 70, 80], "score": 0.25 }]));
    }

    #[tokio::test]
    async fn test_faces_lists_all_results() {
        let rig = rig();
        publish_results(&rig.app);
        let (_, body) = get_json(&rig.app, "/api/faces").await;
        let faces = body.as_array().unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0]["name"], "alice");
        assert_eq!(faces[0]["bbox"], json!([1, 2, 30, 40]));
        assert_eq!(faces[1]["name"], "Unknown");
    }

    #[tokio::test]
    async fn test_add_face_validation() {
        let rig = rig();
        for body in [
            json!({ "bbox": [0, 0, 10, 10] }),
            json!({ "name": "   ", "bbox": [0, 0, 10, 10] }),
            json!({ "name": "carol" }),
            json!({ "name": "../carol", "bbox": [0, 0, 10, 10] }),
            json!({ "name": "carol", "bbox": [0, 0, 10, 10], "frameCount": 1000 }),
            json!({ "name": "carol", "bbox": [0, 0, 10, 10], "interval": -1.0 }),
        ] {
            let (status, resp) = post_json(&rig.app, "/api/add_face", body.clone()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(resp["ok"], false);
            assert!(resp["error"].is_string());
        }
        assert!(!rig.dir.path().join("carol").exists());
    }

    #[tokio::test]
    async fn test_add_face_without_content_type() {
        let rig = rig();
        publish_results(&rig.app);

        let body = json!({ "name": "dave", "bbox": [10, 10, 60, 60], "frameCount": 1 });
        let request = Request::post("/api/add_face")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, resp) = send(&rig.app, request).await;
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["saved"], 1);

        let request = Request::post("/api/add_face").body(Body::from("{not json")).unwrap();
        let (status, resp) = send(&rig.app, request).await;
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["ok"], false);
    }

    #[tokio::test]
    async fn test_add_face_saves_and_reloads() {
        let rig = rig();
        publish_results(&rig.app);
        let (status, body) = post_json(
            &rig.app,
            "/api/add_face",
            json!({
                "name": "carol",
                "bbox": [10.4, 10, 60, 60.2],
                "frameCount": 3,
                "interval": 0
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "saved": 3 }));
        assert_eq!(rig.app.store.generation(), 2);
        assert_eq!(rig.app.store.snapshot().get("carol").unwrap().len(), 3);

        // Alias and defaults.
        let (_, body) = post_json(
            &rig.app,
            "/api/add_face",
            json!({ "name": "carol", "bbox": [10, 10, 60, 60], "num_frames": 1 }),
        )
        .await;
        assert_eq!(body, json!({ "ok": true, "saved": 1 }));
        assert!(rig.dir.path().join("carol/004.jpg").exists());
    }

    #[tokio::test]
    async fn test_add_face_without_frame() {
        let rig = rig();
        let (status, body) = post_json(
            &rig.app,
            "/api/add_face",
            json!({ "name": "carol", "bbox": [0, 0, 10, 10] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": false, "saved": 0 }));
        assert_eq!(rig.app.store.generation(), 1);
    }

    #[tokio::test]
    async fn test_video_feed_unknown_camera() {
        let rig = rig();
        let request = Request::get("/video_feed/cam9").body(Body::empty()).unwrap();
        let (status, _) = send(&rig.app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_video_feed_terminated_before_first_frame() {
        let rig = rig();
        rig.status_tx.send_replace(PipelineState::Terminated);
        drop(rig.frames_tx);
        let request = Request::get("/video_feed/cam1").body(Body::empty()).unwrap();
        let (status, _) = send(&rig.app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_video_feed_streams_latest_frame_then_ends() {
        let rig = rig();
        rig.frames_tx.send_replace(Some(Bytes::from_static(b"first")));
        rig.frames_tx.send_replace(Some(Bytes::from_static(b"\xFF\xD8jpeg")));
        drop(rig.frames_tx);

        let response = router(rig.app.clone())
            .oneshot(Request::get("/video_feed/cam1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            &body[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8jpeg\r\n".as_slice()
        );
    }

    #[tokio::test]
    async fn test_people_and_reload() {
        let rig = rig();
        let (_, body) = get_json(&rig.app, "/api/people").await;
        assert_eq!(body["generation"], 1);
        assert_eq!(body["persons"].as_array().unwrap().len(), 2);

        let request = Request::post("/api/reload").body(Body::empty()).unwrap();
        let (status, body) = send(&rig.app, request).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["generation"], 2);
        assert_eq!(body["report"]["persons"], 2);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_mapping() {
        let rig = rig();
        let root = rig.dir.path().to_path_buf();
        std::fs::remove_dir_all(&root).unwrap();

        let request = Request::post("/api/reload").body(Body::empty()).unwrap();
        let (status, body) = send(&rig.app, request).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], false);
        assert_eq!(body["generation"], 1);
        assert_eq!(body["persons"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health() {
        let rig = rig();
        publish_results(&rig.app);
        let (status, body) = get_json(&rig.app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pipeline"], "streaming");
        assert_eq!(body["persons"], 2);
        assert_eq!(body["frames_published"], 1);
    }
}
