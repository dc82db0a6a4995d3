//! The most recent annotated frame and its match results.
//!
//! Written only by the frame pipeline, read by request handlers. Both sides
//! hold the lock just long enough to swap or clone; cropping, encoding and
//! JSON construction happen after it is released.

use facewatch_core::FaceResult;
use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Latest {
    frame: Option<Arc<RgbImage>>,
    results: Vec<FaceResult>,
    published: u64,
}

/// Lock-guarded holder of the latest pipeline output.
#[derive(Default)]
pub struct SharedFrameState {
    inner: Mutex<Latest>,
}

impl SharedFrameState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Latest> {
        // Writers replace fields whole, so the state is consistent even if a
        // holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current frame and results.
    pub fn publish(&self, frame: Arc<RgbImage>, results: Vec<FaceResult>) {
        let (old_frame, old_results) = {
            let mut latest = self.lock();
            latest.published += 1;
            (
                latest.frame.replace(frame),
                std::mem::replace(&mut latest.results, results),
            )
        };
        // Dropped outside the critical section.
        drop(old_frame);
        drop(old_results);
    }

    /// The current annotated frame, if any has been published.
    pub fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        self.lock().frame.clone()
    }

    pub fn latest_results(&self) -> Vec<FaceResult> {
        self.lock().results.clone()
    }

    /// Results whose label is "Unknown".
    pub fn unknown_faces(&self) -> Vec<FaceResult> {
        let mut results = self.latest_results();
        results.retain(FaceResult::is_unknown);
        results
    }

    /// Number of publishes so far.
    pub fn published(&self) -> u64 {
        self.lock().published
    }
}
