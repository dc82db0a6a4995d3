use anyhow::{Context, Result};
use facewatch_core::recognizer::ARCFACE_EMBEDDING_DIM;
use facewatch_core::{ArcFaceEngine, ReferenceLoader, ReferenceStore, ScrfdDetector};
use facewatch_hw::V4lOpener;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod annotate;
mod config;
mod enroll;
mod http;
mod pipeline;
mod sink;
mod state;
#[cfg(test)]
mod testutil;

use annotate::Annotator;
use config::Config;
use enroll::Enroller;
use pipeline::{Pipeline, PipelineConfig};
use sink::{DetectionSink, RateLimitedSink, SqliteSink};
use state::SharedFrameState;

/// Load one detector/engine pair. The pipeline and the reference loader each
/// get their own, since both run blocking inference concurrently.
fn load_engines(config: &Config) -> Result<(ScrfdDetector, ArcFaceEngine)> {
    let scrfd_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&scrfd_path)
        .with_context(|| format!("loading {}", scrfd_path.display()))?
        .with_confidence_threshold(config.detection_confidence);

    let arcface_path = config.arcface_model_path();
    let engine = ArcFaceEngine::load(&arcface_path)
        .with_context(|| format!("loading {}", arcface_path.display()))?;

    Ok((detector, engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load()?;
    tracing::info!(
        faces_dir = %config.faces_dir.display(),
        model_dir = %config.model_dir.display(),
        cameras = ?config.camera_devices,
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.faces_dir)
        .with_context(|| format!("creating {}", config.faces_dir.display()))?;

    let (detector, engine) = load_engines(&config)?;
    let loader = ReferenceLoader::new(Box::new(detector), Box::new(engine))
        .with_expected_dim(ARCFACE_EMBEDDING_DIM);
    let store = Arc::new(ReferenceStore::new(&config.faces_dir, loader));
    if let Err(e) = store.reload() {
        tracing::warn!(error = %e, "starting with an empty reference store");
    }

    let sink: Option<Box<dyn DetectionSink>> = match SqliteSink::open(&config.db_path) {
        Ok(sink) => {
            tracing::info!(path = %config.db_path.display(), "detection sink opened");
            Some(Box::new(RateLimitedSink::new(sink, config.record_cooldown)))
        }
        Err(e) => {
            tracing::warn!(
                path = %config.db_path.display(),
                error = %e,
                "detection sink unavailable; sightings not recorded"
            );
            None
        }
    };

    let annotator = match &config.font_path {
        Some(path) => Annotator::with_font_file(path),
        None => Annotator::plain(),
    };

    let frame_state = Arc::new(SharedFrameState::new());
    let (detector, engine) = load_engines(&config)?;
    let pipeline = Pipeline::new(
        PipelineConfig {
            candidates: config.candidates(),
            threshold: config.similarity_threshold,
            policy: config.failure_policy(),
            jpeg_quality: config.jpeg_quality,
        },
        Box::new(V4lOpener),
        Box::new(detector),
        Box::new(engine),
        store.clone(),
        frame_state.clone(),
    )
    .with_expected_dim(ARCFACE_EMBEDDING_DIM)
    .with_annotator(annotator)
    .with_sink(sink);

    let handle = pipeline::spawn_pipeline(pipeline)?;

    let enroller = Arc::new(Enroller::new(
        frame_state.clone(),
        store.clone(),
        &config.faces_dir,
        config.reload_mode,
    ));

    let app = http::router(http::AppState {
        frame_state,
        store,
        enroller,
        frames: handle.frames,
        pipeline: handle.status,
        camera_id: Arc::from(config.camera_id.as_str()),
        enroll_defaults: http::EnrollDefaults {
            frames: config.enroll_frames,
            interval: config.enroll_interval,
        },
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, camera = %config.camera_id, "facewatchd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("facewatchd shutting down");
        })
        .await?;

    // A live pipeline thread is blocked on the camera and ends with the process.
    if handle.thread.is_finished() {
        if let Ok(reason) = handle.thread.join() {
            tracing::info!(reason = %reason, "pipeline had already terminated");
        }
    }
    Ok(())
}
