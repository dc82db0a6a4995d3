//! Fake engines and a tiny on-disk reference store for daemon tests.

use facewatch_core::detector::DetectorError;
use facewatch_core::recognizer::RecognizerError;
use facewatch_core::{
    BoundingBox, FaceDetector, FaceRegion, FeatureEngine, RawFeature, ReferenceLoader,
    ReferenceStore,
};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::Arc;

pub const RED: [u8; 3] = [200, 0, 0];
pub const GREEN: [u8; 3] = [0, 200, 0];
pub const BLUE: [u8; 3] = [0, 0, 200];

/// One face covering the whole image unless pixel (0, 0) is black.
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if image.get_pixel(0, 0).0 == [0, 0, 0] {
            return Ok(Vec::new());
        }
        Ok(vec![FaceRegion {
            bbox: BoundingBox::new(0, 0, image.width() as i32, image.height() as i32),
            confidence: 0.9,
        }])
    }
}

/// Reports a fixed set of regions, or fails every call.
pub struct FixedDetector {
    pub regions: Vec<BoundingBox>,
    pub fail: bool,
}

impl FaceDetector for FixedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if self.fail {
            return Err(DetectorError::InferenceFailed("simulated".into()));
        }
        Ok(self
            .regions
            .iter()
            .map(|&bbox| FaceRegion { bbox, confidence: 0.9 })
            .collect())
    }
}

/// Embeds the colour at the region's top-left corner. Black yields an
/// empty feature.
pub struct ColorEngine;

impl FeatureEngine for ColorEngine {
    fn extract_feature(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<RawFeature, RecognizerError> {
        let b = face.bbox.clamp(image.width(), image.height());
        if b.is_empty() {
            return Err(RecognizerError::EmptyCrop);
        }
        let px = image.get_pixel(b.x1 as u32, b.y1 as u32).0;
        if px == [0, 0, 0] {
            return Ok(RawFeature::Empty);
        }
        Ok(RawFeature::Flat(px.iter().map(|&c| c as f32).collect()))
    }
}

pub fn loader() -> ReferenceLoader {
    ReferenceLoader::new(Box::new(FullFrameDetector), Box::new(ColorEngine))
}

pub fn write_face(root: &Path, person: &str, file: &str, rgb: [u8; 3]) {
    let dir = root.join(person);
    std::fs::create_dir_all(&dir).unwrap();
    RgbImage::from_pixel(8, 8, Rgb(rgb)).save(dir.join(file)).unwrap();
}

/// Store with alice (red) and bob (green), already loaded once.
pub fn loaded_store(root: &Path) -> Arc<ReferenceStore> {
    write_face(root, "alice", "001.png", RED);
    write_face(root, "bob", "001.png", GREEN);
    let store = Arc::new(ReferenceStore::new(root, loader()));
    store.reload().unwrap();
    store
}

/// 64x64 frame: red square at (0,0)-(16,16), blue square at (32,32)-(48,48),
/// grey elsewhere.
pub fn two_face_frame() -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        if x < 16 && y < 16 {
            Rgb(RED)
        } else if (32..48).contains(&x) && (32..48).contains(&y) {
            Rgb(BLUE)
        } else {
            Rgb([90, 90, 90])
        }
    })
}

pub fn two_face_regions() -> Vec<BoundingBox> {
    vec![BoundingBox::new(0, 0, 16, 16), BoundingBox::new(32, 32, 48, 48)]
}
