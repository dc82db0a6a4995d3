//! Contracts for the detection and feature-extraction engines.
//!
//! The pipeline and the reference store only talk to these traits; the
//! ONNX implementations live in [`crate::detector`] and [`crate::recognizer`].

use crate::detector::DetectorError;
use crate::embedding::RawFeature;
use crate::recognizer::RecognizerError;
use crate::types::FaceRegion;
use image::RgbImage;

/// Finds face regions in a frame.
///
/// Implementations may hold inference state, hence `&mut self`.
pub trait FaceDetector: Send {
    /// Regions are clamped to the frame and sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Produces the engine's raw per-face feature output.
pub trait FeatureEngine: Send {
    fn extract_feature(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<RawFeature, RecognizerError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        (**self).detect(image)
    }
}

impl<T: FeatureEngine + ?Sized> FeatureEngine for Box<T> {
    fn extract_feature(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<RawFeature, RecognizerError> {
        (**self).extract_feature(image, face)
    }
}
