//! The capture → detect → match → annotate → publish loop.
//!
//! Runs on a dedicated OS thread since every stage blocks. Output goes two
//! ways: the annotated frame and results into [`SharedFrameState`], and the
//! encoded JPEG into a `watch` channel that only ever holds the newest frame.
//! Slow stream consumers therefore skip frames instead of queueing them.

use crate::annotate::Annotator;
use crate::sink::DetectionSink;
use crate::state::SharedFrameState;
use bytes::Bytes;
use facewatch_core::{
    CosineMatcher, DetectedFace, EmbeddingExtractor, FaceDetector, FaceRegion, FaceResult,
    FeatureEngine, Matcher, ReferenceStore,
};
use facewatch_hw::{
    frame, open_first, CameraError, CameraOpener, CameraSource, Frame, SourceConfig,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[source] CameraError),
    #[error("{failures} consecutive frame reads failed")]
    ReadFailuresExhausted { failures: u32 },
    #[error("camera still failing after {attempts} reconnect attempts")]
    ReconnectsExhausted { attempts: u32 },
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Pipeline lifecycle, observable through [`PipelineHandle::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Connecting,
    Streaming,
    /// Reads are failing; retrying below the cap.
    Reconnecting,
    Terminated,
}

/// What to do once consecutive read failures reach the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    Terminate,
    /// Release the camera and go back to connecting.
    Reconnect,
}

impl FromStr for ExhaustedAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" => Ok(ExhaustedAction::Terminate),
            "reconnect" => Ok(ExhaustedAction::Reconnect),
            other => Err(format!("unknown read-failure action {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Consecutive failed reads that exhaust a source. Treated as at least 1.
    pub max_consecutive_failures: u32,
    pub on_exhausted: ExhaustedAction,
    /// Reopen attempts without an intervening good frame.
    pub max_reconnects: u32,
    /// Pause between failed reads.
    pub retry_delay: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 20,
            on_exhausted: ExhaustedAction::Terminate,
            max_reconnects: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

pub struct PipelineConfig {
    pub candidates: Vec<SourceConfig>,
    pub threshold: f32,
    pub policy: FailurePolicy,
    pub jpeg_quality: u8,
}

/// Counters from one streaming session, which always ends on exhausted reads.
struct Session {
    failures: u32,
    frames: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    opener: Box<dyn CameraOpener>,
    detector: Box<dyn FaceDetector>,
    extractor: EmbeddingExtractor<Box<dyn FeatureEngine>>,
    matcher: CosineMatcher,
    store: Arc<ReferenceStore>,
    state: Arc<SharedFrameState>,
    annotator: Annotator,
    sink: Option<Box<dyn DetectionSink>>,
    frames: watch::Sender<Option<Bytes>>,
    status: watch::Sender<PipelineState>,
    store_was_usable: Option<bool>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        opener: Box<dyn CameraOpener>,
        detector: Box<dyn FaceDetector>,
        engine: Box<dyn FeatureEngine>,
        store: Arc<ReferenceStore>,
        state: Arc<SharedFrameState>,
    ) -> Self {
        let (frames, _) = watch::channel(None);
        let (status, _) = watch::channel(PipelineState::Connecting);
        Self {
            config,
            opener,
            detector,
            extractor: EmbeddingExtractor::new(engine),
            matcher: CosineMatcher,
            store,
            state,
            annotator: Annotator::plain(),
            sink: None,
            frames,
            status,
            store_was_usable: None,
        }
    }

    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.extractor = self.extractor.with_expected_dim(dim);
        self
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_sink(mut self, sink: Option<Box<dyn DetectionSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Encoded JPEG stream. Yields `None` until the first frame; closes
    /// when the pipeline terminates.
    pub fn frames(&self) -> watch::Receiver<Option<Bytes>> {
        self.frames.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<PipelineState> {
        self.status.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        self.status.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "pipeline state");
            *current = state;
            true
        });
    }

    /// Run until the camera is unavailable or the failure policy gives up.
    /// Always returns the reason for termination.
    pub fn run(mut self) -> PipelineError {
        let policy = self.config.policy;
        let mut reconnects = 0u32;

        let reason = loop {
            self.set_state(PipelineState::Connecting);
            let opened = open_first(self.opener.as_mut(), &self.config.candidates);
            let (mut source, chosen) = match opened {
                Ok(opened) => opened,
                Err(e) => break PipelineError::CameraUnavailable(e),
            };

            self.set_state(PipelineState::Streaming);
            let Session { failures, frames } = self.stream(source.as_mut());

            drop(source);
            tracing::info!(device = %chosen.device, frames, "camera released");

            if frames > 0 {
                reconnects = 0;
            }
            match policy.on_exhausted {
                ExhaustedAction::Terminate => {
                    break PipelineError::ReadFailuresExhausted { failures };
                }
                ExhaustedAction::Reconnect if reconnects >= policy.max_reconnects => {
                    break PipelineError::ReconnectsExhausted { attempts: reconnects };
                }
                ExhaustedAction::Reconnect => {
                    reconnects += 1;
                    tracing::warn!(
                        attempt = reconnects,
                        max = policy.max_reconnects,
                        "reconnecting camera"
                    );
                }
            }
        };

        tracing::error!(error = %reason, "pipeline terminated");
        self.set_state(PipelineState::Terminated);
        // Dropping `self` closes the frame channel, which ends every stream.
        reason
    }

    fn stream(&mut self, source: &mut dyn CameraSource) -> Session {
        let policy = self.config.policy;
        let cap = policy.max_consecutive_failures.max(1);
        let mut failures = 0u32;
        let mut frames = 0u64;

        loop {
            match source.read() {
                Ok(frame) => {
                    if failures > 0 {
                        tracing::info!(after = failures, "frame reads recovered");
                        self.set_state(PipelineState::Streaming);
                    }
                    failures = 0;
                    frames += 1;
                    self.process(frame);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= cap {
                        tracing::error!(
                            failures,
                            error = %e,
                            reason = "read_failures_exhausted",
                            "camera read failed"
                        );
                        return Session { failures, frames };
                    }
                    tracing::warn!(
                        failures,
                        cap,
                        error = %e,
                        reason = "read_failed",
                        "camera read failed; retrying"
                    );
                    self.set_state(PipelineState::Reconnecting);
                    if !policy.retry_delay.is_zero() {
                        std::thread::sleep(policy.retry_delay);
                    }
                }
            }
        }
    }

    fn process(&mut self, frame: Frame) {
        let gallery = self.store.snapshot();
        let usable = gallery.is_usable();
        if self.store_was_usable != Some(usable) {
            if !usable {
                tracing::warn!(
                    reason = "empty_reference_data",
                    "no usable reference faces; every face is unknown"
                );
            }
            self.store_was_usable = Some(usable);
        }

        let mut image = frame.image;
        let regions = match self.detector.detect(&image) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(
                    sequence = frame.sequence,
                    error = %e,
                    reason = "detection_failed",
                    "face detection failed"
                );
                Vec::new()
            }
        };

        let mut results = Vec::with_capacity(regions.len());
        for region in regions {
            // Detector output is not trusted to stay inside the frame.
            let bbox = region.bbox.clamp(image.width(), image.height());
            if bbox.is_empty() {
                tracing::debug!(bbox = ?region.bbox, reason = "outside_frame", "face box dropped");
                continue;
            }
            let region = FaceRegion { bbox, ..region };
            let face = DetectedFace {
                bbox,
                embedding: match self.extractor.extract(&image, &region) {
                    Ok(embedding) => Some(embedding),
                    Err(e) => {
                        tracing::warn!(
                            bbox = ?bbox,
                            error = %e,
                            reason = e.reason(),
                            "embedding extraction failed"
                        );
                        None
                    }
                },
            };
            let Some(embedding) = &face.embedding else {
                continue;
            };
            let matched = self.matcher.best_match(&gallery, embedding, self.config.threshold);
            results.push(FaceResult::new(face.bbox, matched));
        }

        self.record_known(&image, &results);
        self.annotator.annotate(&mut image, &results);

        let image = Arc::new(image);
        self.state.publish(Arc::clone(&image), results);

        match frame::encode_jpeg(&image, self.config.jpeg_quality) {
            Ok(jpeg) => {
                self.frames.send_replace(Some(Bytes::from(jpeg)));
            }
            Err(e) => tracing::warn!(error = %e, reason = "encode_failed", "frame encode failed"),
        }
    }

    /// Hand known faces to the sink. Failures are logged and ignored.
    fn record_known(&mut self, image: &RgbImage, results: &[FaceResult]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let now = chrono::Utc::now();
        for result in results.iter().filter(|r| !r.is_unknown()) {
            let crop = frame::crop(image, result.bbox);
            let jpeg = match crop.map(|c| frame::encode_jpeg(&c, 85)) {
                Some(Ok(jpeg)) => jpeg,
                Some(Err(e)) => {
                    tracing::warn!(
                        person = %result.name,
                        error = %e,
                        "sighting crop encode failed"
                    );
                    continue;
                }
                None => continue,
            };
            match sink.record(&result.name, now, &jpeg) {
                Ok(true) => {
                    tracing::info!(person = %result.name, score = result.score, "sighting recorded")
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    person = %result.name,
                    error = %e,
                    reason = "persistence_failed",
                    "sighting not recorded"
                ),
            }
        }
    }
}

/// Receivers for a running pipeline plus its thread.
pub struct PipelineHandle {
    pub frames: watch::Receiver<Option<Bytes>>,
    pub status: watch::Receiver<PipelineState>,
    pub thread: std::thread::JoinHandle<PipelineError>,
}

/// Spawn the pipeline on a dedicated OS thread.
pub fn spawn_pipeline(pipeline: Pipeline) -> Result<PipelineHandle, PipelineError> {
    let frames = pipeline.frames();
    let status = pipeline.status();

    let thread = std::thread::Builder::new()
        .name("facewatch-pipeline".into())
        .spawn(move || {
            tracing::info!("pipeline thread started");
            pipeline.run()
        })
        .map_err(PipelineError::Spawn)?;

    Ok(PipelineHandle { frames, status, thread })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use crate::testutil::{self, ColorEngine, FixedDetector};
    use chrono::{DateTime, Utc};
    use facewatch_core::BoundingBox;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Plays back a script of good (`Some`) and failed (`None`) reads, then
    /// fails forever.
    struct ScriptedCamera {
        script: VecDeque<Option<RgbImage>>,
        reads: Arc<AtomicU32>,
    }

    impl CameraSource for ScriptedCamera {
        fn read(&mut self) -> Result<Frame, CameraError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front().flatten() {
                Some(image) => Ok(Frame::new(image, n)),
                None => Err(CameraError::CaptureFailed("scripted failure".into())),
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Hands out one scripted camera per successful open.
    struct ScriptedOpener {
        sessions: VecDeque<Vec<Option<RgbImage>>>,
        opens: Arc<AtomicU32>,
        reads: Arc<AtomicU32>,
    }

    impl ScriptedOpener {
        fn new(sessions: Vec<Vec<Option<RgbImage>>>) -> Self {
            Self {
                sessions: sessions.into(),
                opens: Arc::default(),
                reads: Arc::default(),
            }
        }
    }

    impl CameraOpener for ScriptedOpener {
        fn open(&mut self, config: &SourceConfig) -> Result<Box<dyn CameraSource>, CameraError> {
            match self.sessions.pop_front() {
                Some(script) => {
                    self.opens.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(ScriptedCamera {
                        script: script.into(),
                        reads: self.reads.clone(),
                    }))
                }
                None => Err(CameraError::DeviceNotFound(config.device.clone())),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<String>>>);

    impl DetectionSink for MemorySink {
        fn record(
            &mut self,
            person: &str,
            _at: DateTime<Utc>,
            jpeg: &[u8],
        ) -> Result<bool, SinkError> {
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            self.0.lock().unwrap().push(person.to_string());
            Ok(true)
        }
    }

    fn candidates() -> Vec<SourceConfig> {
        vec![SourceConfig {
            device: "/dev/video0".into(),
            width: 64,
            height: 64,
        }]
    }

    fn policy(cap: u32, on_exhausted: ExhaustedAction, max_reconnects: u32) -> FailurePolicy {
        FailurePolicy {
            max_consecutive_failures: cap,
            on_exhausted,
            max_reconnects,
            retry_delay: Duration::ZERO,
        }
    }

    struct Rig {
        pipeline: Pipeline,
        state: Arc<SharedFrameState>,
        _dir: tempfile::TempDir,
    }

    fn rig(opener: ScriptedOpener, detector: FixedDetector, policy: FailurePolicy) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = testutil::loaded_store(dir.path());
        let state = Arc::new(SharedFrameState::new());
        let pipeline = Pipeline::new(
            PipelineConfig {
                candidates: candidates(),
                threshold: 0.7,
                policy,
                jpeg_quality: 80,
            },
            Box::new(opener),
            Box::new(detector),
            Box::new(ColorEngine),
            store,
            state.clone(),
        );
        Rig {
            pipeline,
            state,
            _dir: dir,
        }
    }

    fn faces() -> FixedDetector {
        FixedDetector {
            regions: testutil::two_face_regions(),
            fail: false,
        }
    }

    fn good() -> Option<RgbImage> {
        Some(testutil::two_face_frame())
    }

    #[test]
    fn test_cap_of_twenty_failures_terminates() {
        let opener = ScriptedOpener::new(vec![vec![None; 20]]);
        let reads = opener.reads.clone();
        let rig = rig(opener, faces(), policy(20, ExhaustedAction::Terminate, 0));
        let frames = rig.pipeline.frames();
        let status = rig.pipeline.status();

        let err = rig.pipeline.run();
        assert!(matches!(err, PipelineError::ReadFailuresExhausted { failures: 20 }));
        assert_eq!(reads.load(Ordering::SeqCst), 20);
        assert_eq!(*status.borrow(), PipelineState::Terminated);
        assert!(frames.has_changed().is_err(), "frame channel should be closed");
        assert_eq!(rig.state.published(), 0);
    }

    #[test]
    fn test_no_candidates_is_camera_unavailable() {
        let rig = rig(ScriptedOpener::new(Vec::new()), faces(), FailurePolicy::default());
        let status = rig.pipeline.status();
        assert!(matches!(rig.pipeline.run(), PipelineError::CameraUnavailable(_)));
        assert_eq!(*status.borrow(), PipelineState::Terminated);
    }

    #[test]
    fn test_empty_candidate_list() {
        let opener = ScriptedOpener::new(vec![vec![good()]]);
        let mut rig = rig(opener, faces(), FailurePolicy::default());
        rig.pipeline.config.candidates.clear();
        assert!(matches!(
            rig.pipeline.run(),
            PipelineError::CameraUnavailable(CameraError::Unavailable { .. })
        ));
        assert_eq!(rig.state.published(), 0);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut script = vec![None; 4];
        script.push(good());
        script.extend(vec![None; 4]);
        script.push(good());
        let opener = ScriptedOpener::new(vec![script]);
        let rig = rig(opener, faces(), policy(5, ExhaustedAction::Terminate, 0));

        let err = rig.pipeline.run();
        assert!(matches!(err, PipelineError::ReadFailuresExhausted { failures: 5 }));
        assert_eq!(rig.state.published(), 2);
    }

    #[test]
    fn test_reconnect_policy_reopens_then_gives_up() {
        let opener = ScriptedOpener::new(vec![vec![None; 3]; 4]);
        let opens = opener.opens.clone();
        let rig = rig(opener, faces(), policy(3, ExhaustedAction::Reconnect, 2));

        let err = rig.pipeline.run();
        assert!(matches!(err, PipelineError::ReconnectsExhausted { attempts: 2 }));
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reconnect_ends_when_camera_disappears() {
        let opener = ScriptedOpener::new(vec![vec![good(), None, None]]);
        let rig = rig(opener, faces(), policy(2, ExhaustedAction::Reconnect, 5));
        assert!(matches!(rig.pipeline.run(), PipelineError::CameraUnavailable(_)));
        assert_eq!(rig.state.published(), 1);
    }

    #[test]
    fn test_frames_are_matched_and_published() {
        let opener = ScriptedOpener::new(vec![vec![good(), good()]]);
        let rig = rig(opener, faces(), policy(1, ExhaustedAction::Terminate, 0));
        let mut frames = rig.pipeline.frames();
        let sink = MemorySink::default();
        let pipeline = rig.pipeline.with_sink(Some(Box::new(sink.clone())));

        pipeline.run();

        let results = rig.state.latest_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "alice");
        assert!((results[0].score - 1.0).abs() < 1e-3);
        assert!(results[1].is_unknown());
        assert!(results[1].score.abs() < 1e-3);
        assert_eq!(rig.state.unknown_faces().len(), 1);

        // Annotation drew a green box over the red face's edge.
        let frame = rig.state.latest_frame().unwrap();
        assert_eq!(frame.get_pixel(0, 8).0, [0, 255, 0]);

        // The final frame is still readable after the sender is gone.
        assert!(frames.has_changed().is_err());
        let jpeg = frames.borrow_and_update().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        assert_eq!(*sink.0.lock().unwrap(), vec!["alice", "alice"]);
    }

    #[test]
    fn test_detection_failure_publishes_empty_results() {
        let opener = ScriptedOpener::new(vec![vec![good()]]);
        let detector = FixedDetector {
            regions: testutil::two_face_regions(),
            fail: true,
        };
        let rig = rig(opener, detector, policy(1, ExhaustedAction::Terminate, 0));
        rig.pipeline.run();
        assert_eq!(rig.state.published(), 1);
        assert!(rig.state.latest_results().is_empty());
    }

    #[test]
    fn test_failed_extraction_skips_only_that_face() {
        let mut image = testutil::two_face_frame();
        for x in 20..28 {
            for y in 20..28 {
                image.put_pixel(x, y, image::Rgb([0, 0, 0]));
            }
        }
        let opener = ScriptedOpener::new(vec![vec![Some(image)]]);
        let detector = FixedDetector {
            // The black middle region yields an empty feature.
            regions: vec![
                BoundingBox::new(0, 0, 16, 16),
                BoundingBox::new(20, 20, 28, 28),
                BoundingBox::new(32, 32, 48, 48),
            ],
            fail: false,
        };
        let rig = rig(opener, detector, policy(1, ExhaustedAction::Terminate, 0));
        rig.pipeline.run();
        let results = rig.state.latest_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "alice");
        assert!(results[1].is_unknown());
    }

    #[test]
    fn test_published_boxes_are_clamped_to_frame() {
        let opener = ScriptedOpener::new(vec![vec![good()]]);
        let detector = FixedDetector {
            regions: vec![
                BoundingBox::new(-5, -3, 16, 16),
                BoundingBox::new(32, 32, 900, 900),
                BoundingBox::new(-40, -40, -1, -1),
            ],
            fail: false,
        };
        let rig = rig(opener, detector, policy(1, ExhaustedAction::Terminate, 0));
        rig.pipeline.run();

        let results = rig.state.latest_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].bbox, BoundingBox::new(0, 0, 16, 16));
        assert_eq!(results[0].name, "alice");
        assert_eq!(results[1].bbox, BoundingBox::new(32, 32, 64, 64));
        for r in &results {
            let b = r.bbox;
            assert!(b.x1 >= 0 && b.y1 >= 0 && b.x2 <= 64 && b.y2 <= 64, "{b:?}");
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let opener = ScriptedOpener::new(vec![vec![good()]]);
        let mut rig = rig(opener, faces(), policy(1, ExhaustedAction::Terminate, 0));
        rig.pipeline.config.threshold = 1.01;
        rig.pipeline.run();
        let results = rig.state.latest_results();
        assert!(results.iter().all(FaceResult::is_unknown));
        // Score retained for diagnostics.
        assert!((results[0].score - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_spawned_pipeline_terminates() {
        let opener = ScriptedOpener::new(vec![vec![good(), None]]);
        let rig = rig(opener, faces(), policy(1, ExhaustedAction::Terminate, 0));
        let handle = spawn_pipeline(rig.pipeline).unwrap();
        let err = handle.thread.join().unwrap();
        assert!(matches!(err, PipelineError::ReadFailuresExhausted { .. }));
        assert_eq!(*handle.status.borrow(), PipelineState::Terminated);
        assert!(handle.frames.borrow().is_some());
    }
}
