//! Multi-frame enrollment from the live shared frame.
//!
//! Samples the most recently published frame (never a fresh capture), saves
//! the requested crop as the next numbered image in the person's directory,
//! then reloads the reference store. Individual save failures only lower the
//! saved count.

use crate::config::ReloadMode;
use crate::state::SharedFrameState;
use facewatch_core::store::is_image_file;
use facewatch_core::{BoundingBox, ReferenceStore};
use facewatch_hw::frame;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EnrollError {
    #[error("name is empty")]
    EmptyName,
    #[error("name {0:?} is not a valid directory name")]
    InvalidName(String),
}

/// Why one sample was not saved.
#[derive(Error, Debug)]
enum SaveError {
    #[error("crop is empty after clamping to the frame")]
    EmptyCrop,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image write failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("save task failed: {0}")]
    Join(String),
}

impl SaveError {
    fn reason(&self) -> &'static str {
        match self {
            SaveError::EmptyCrop => "empty_crop",
            SaveError::Io(_) | SaveError::Image(_) => "persistence_failed",
            SaveError::Join(_) => "task_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub name: String,
    pub bbox: BoundingBox,
    pub frame_count: usize,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnrollOutcome {
    /// Samples for which a frame was available.
    pub attempted: usize,
    pub saved: usize,
    /// Store reloads triggered by this call.
    pub reloads: usize,
}

/// Check that `name` is a single, ordinary path component.
pub fn validate_name(name: &str) -> Result<&str, EnrollError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EnrollError::EmptyName);
    }
    let unsafe_char = |c: char| c == '/' || c == '\\' || c.is_control();
    if name == "." || name == ".." || name.chars().any(unsafe_char) {
        return Err(EnrollError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Index for the next saved image: one past the largest numeric file stem.
pub fn next_index(dir: &Path) -> std::io::Result<u32> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(e),
    };
    let max = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| is_image_file(p))
        .filter_map(|p| p.file_stem()?.to_str()?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    Ok(max + 1)
}

fn save_crop(image: &RgbImage, bbox: BoundingBox, dir: &Path) -> Result<PathBuf, SaveError> {
    let crop = frame::crop(image, bbox).ok_or(SaveError::EmptyCrop)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{:03}.jpg", next_index(dir)?));
    crop.save_with_format(&path, ImageFormat::Jpeg)?;
    Ok(path)
}

pub struct Enroller {
    state: Arc<SharedFrameState>,
    store: Arc<ReferenceStore>,
    faces_dir: PathBuf,
    reload_mode: ReloadMode,
    /// Numbering and writing happen under this lock so concurrent
    /// enrollments never pick the same index.
    save_lock: Arc<Mutex<()>>,
}

impl Enroller {
    pub fn new(
        state: Arc<SharedFrameState>,
        store: Arc<ReferenceStore>,
        faces_dir: impl Into<PathBuf>,
        reload_mode: ReloadMode,
    ) -> Self {
        Self {
            state,
            store,
            faces_dir: faces_dir.into(),
            reload_mode,
            save_lock: Arc::default(),
        }
    }

    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrollOutcome, EnrollError> {
        let name = validate_name(&request.name)?.to_string();
        let person_dir = self.faces_dir.join(&name);
        let mut outcome = EnrollOutcome {
            attempted: 0,
            saved: 0,
            reloads: 0,
        };

        tracing::info!(
            person = %name,
            frames = request.frame_count,
            bbox = ?request.bbox,
            "enrollment started"
        );

        for sample in 0..request.frame_count {
            if sample > 0 && !request.interval.is_zero() {
                tokio::time::sleep(request.interval).await;
            }

            let Some(image) = self.state.latest_frame() else {
                tracing::warn!(
                    person = %name,
                    sample,
                    reason = "no_frame",
                    "no frame available; stopping enrollment"
                );
                break;
            };
            outcome.attempted += 1;

            match self.save_sample(image, request.bbox, person_dir.clone()).await {
                Ok(path) => {
                    outcome.saved += 1;
                    tracing::info!(
                        person = %name,
                        path = %path.display(),
                        "enrollment image saved"
                    );
                    if self.reload_mode == ReloadMode::PerImage && self.reload().await {
                        outcome.reloads += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        person = %name,
                        sample,
                        error = %e,
                        reason = e.reason(),
                        "enrollment sample not saved"
                    );
                }
            }
        }

        if self.reload_mode == ReloadMode::Batched && outcome.saved > 0 && self.reload().await {
            outcome.reloads += 1;
        }

        tracing::info!(
            person = %name,
            attempted = outcome.attempted,
            saved = outcome.saved,
            reloads = outcome.reloads,
            "enrollment finished"
        );
        Ok(outcome)
    }

    async fn save_sample(
        &self,
        image: Arc<RgbImage>,
        bbox: BoundingBox,
        dir: PathBuf,
    ) -> Result<PathBuf, SaveError> {
        let lock = self.save_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            save_crop(&image, bbox, &dir)
        })
        .await
        .map_err(|e| SaveError::Join(e.to_string()))?
    }

    /// Reload the store off the async runtime. Returns whether it succeeded.
    async fn reload(&self) -> bool {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.reload()).await {
            Ok(Ok(_)) => true,
            // Logged by the store; the previous mapping stays active.
            Ok(Err(_)) => false,
            Err(e) => {
                tracing::error!(error = %e, "reference reload task failed");
                false
            }
        }
    }
}
