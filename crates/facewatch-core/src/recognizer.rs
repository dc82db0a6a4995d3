//! ArcFace feature engine via ONNX Runtime.
//!
//! Crops the detected face, resizes it to the 112x112 model input and
//! returns the raw output tensor. Normalization happens in
//! [`crate::embedding`], not here.

use crate::embedding::RawFeature;
use crate::engine::FeatureEngine;
use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty after clamping to the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based feature engine.
pub struct ArcFaceEngine {
    session: Session,
}

impl ArcFaceEngine {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Crop `face` out of `image` and build the normalized NCHW input.
    fn preprocess(image: &RgbImage, face: &FaceRegion) -> Result<Array4<f32>, RecognizerError> {
        let bbox = face.bbox.clamp(image.width(), image.height());
        if bbox.is_empty() {
            return Err(RecognizerError::EmptyCrop);
        }

        let (x, y) = (bbox.x1 as u32, bbox.y1 as u32);
        let crop = imageops::crop_imm(image, x, y, bbox.width(), bbox.height()).to_image();
        let side = ARCFACE_INPUT_SIZE;
        let face_img = imageops::resize(&crop, side, side, FilterType::Triangle);

        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in face_img.enumerate_pixels() {
            for c in 0..3 {
                let value = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, c, y as usize, x as usize]] = value;
            }
        }
        Ok(tensor)
    }
}

impl FeatureEngine for ArcFaceEngine {
    fn extract_feature(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<RawFeature, RecognizerError> {
        let input = Self::preprocess(image, face)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(RawFeature::Tensor {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.to_vec(),
        })
    }
}
