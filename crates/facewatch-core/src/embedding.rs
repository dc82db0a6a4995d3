//! Embedding extraction: turns an engine's raw feature output into a
//! canonical normalized [`Embedding`].
//!
//! Engines hand back features in several representations. Each one is a
//! [`RawFeature`] variant with its own adapter; anything else fails closed.

use crate::engine::FeatureEngine;
use crate::types::{Embedding, FaceRegion};
use image::RgbImage;
use serde_json::Value;
use thiserror::Error;

/// Raw per-face feature output, one variant per known representation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFeature {
    /// Direct numeric vector.
    Flat(Vec<f32>),
    /// Nested sequence (row-major), flattened before normalization.
    Nested(Vec<Vec<f32>>),
    /// Dense tensor output, e.g. `[1, 512]` from an ONNX session.
    Tensor { shape: Vec<usize>, data: Vec<f32> },
    /// Record exposing a named `embedding` or `feature` field.
    /// `embedding` takes precedence when both are present.
    Structured {
        embedding: Option<Vec<f32>>,
        feature: Option<Vec<f32>>,
    },
    /// The engine returned nothing for this face.
    Empty,
    /// A representation we have no adapter for.
    Unsupported(String),
}

impl RawFeature {
    /// Adapt a JSON value emitted by an out-of-process engine.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => RawFeature::Empty,
            Value::Array(items) if items.is_empty() => RawFeature::Empty,
            Value::Array(items) if items.iter().all(Value::is_number) => {
                match json_numbers(items) {
                    Some(v) => RawFeature::Flat(v),
                    None => RawFeature::Unsupported("array with non-f32 numbers".into()),
                }
            }
            Value::Array(items) if items.iter().all(Value::is_array) => {
                let rows: Option<Vec<Vec<f32>>> = items
                    .iter()
                    .map(|row| row.as_array().and_then(|r| json_numbers(r)))
                    .collect();
                match rows {
                    Some(rows) => RawFeature::Nested(rows),
                    None => RawFeature::Unsupported("nested array with non-numeric rows".into()),
                }
            }
            Value::Object(map) => {
                let field = |name: &str| {
                    map.get(name)
                        .and_then(Value::as_array)
                        .and_then(|a| json_numbers(a))
                };
                let embedding = field("embedding");
                let feature = field("feature");
                if embedding.is_none() && feature.is_none() {
                    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    RawFeature::Unsupported(format!(
                        "object without embedding/feature field: {keys:?}"
                    ))
                } else {
                    RawFeature::Structured { embedding, feature }
                }
            }
            other => RawFeature::Unsupported(json_kind(other).to_string()),
        }
    }

    /// Flatten to a one-dimensional vector.
    fn flatten(self) -> Result<Vec<f32>, ExtractionFailure> {
        let flat = match self {
            RawFeature::Flat(v) => v,
            RawFeature::Nested(rows) => rows.into_iter().flatten().collect(),
            RawFeature::Tensor { shape, data } => {
                let expected: usize = shape.iter().product();
                if expected != data.len() {
                    return Err(ExtractionFailure::UnrecognizedShape(format!(
                        "tensor shape {shape:?} holds {expected} values, got {}",
                        data.len()
                    )));
                }
                data
            }
            RawFeature::Structured { embedding, feature } => {
                match [embedding, feature].into_iter().flatten().find(|v| !v.is_empty()) {
                    Some(v) => v,
                    None => return Err(ExtractionFailure::Empty),
                }
            }
            RawFeature::Empty => return Err(ExtractionFailure::Empty),
            RawFeature::Unsupported(kind) => {
                return Err(ExtractionFailure::UnrecognizedShape(kind));
            }
        };

        if flat.is_empty() {
            return Err(ExtractionFailure::Empty);
        }
        Ok(flat)
    }
}

fn json_numbers(items: &[Value]) -> Option<Vec<f32>> {
    items.iter().map(|v| v.as_f64().map(|x| x as f32)).collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "scalar number",
        Value::String(_) => "string",
        Value::Array(_) => "mixed array",
        Value::Object(_) => "object",
    }
}

/// Why a face produced no embedding. Always per-face and non-fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionFailure {
    #[error("feature engine error: {0}")]
    Engine(String),
    #[error("feature engine returned an empty result")]
    Empty,
    #[error("unrecognized feature representation: {0}")]
    UnrecognizedShape(String),
    #[error("feature contains non-finite values")]
    NonFinite,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ExtractionFailure {
    /// Short machine-friendly reason, used as a log field.
    pub fn reason(&self) -> &'static str {
        match self {
            ExtractionFailure::Engine(_) => "engine_error",
            ExtractionFailure::Empty => "empty_result",
            ExtractionFailure::UnrecognizedShape(_) => "unrecognized_shape",
            ExtractionFailure::NonFinite => "non_finite",
            ExtractionFailure::DimensionMismatch { .. } => "dimension_mismatch",
        }
    }
}

/// Normalize a raw feature into an embedding.
pub fn to_embedding(
    raw: RawFeature,
    expected_dim: Option<usize>,
) -> Result<Embedding, ExtractionFailure> {
    let flat = raw.flatten()?;

    if flat.iter().any(|x| !x.is_finite()) {
        return Err(ExtractionFailure::NonFinite);
    }
    if let Some(expected) = expected_dim {
        if flat.len() != expected {
            return Err(ExtractionFailure::DimensionMismatch {
                expected,
                actual: flat.len(),
            });
        }
    }

    Embedding::from_raw(&flat).ok_or(ExtractionFailure::Empty)
}

/// Wraps a [`FeatureEngine`] and yields normalized embeddings.
pub struct EmbeddingExtractor<E> {
    engine: E,
    expected_dim: Option<usize>,
}

impl<E: FeatureEngine> EmbeddingExtractor<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            expected_dim: None,
        }
    }

    /// Reject embeddings whose length differs from `dim`.
    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.expected_dim = Some(dim);
        self
    }

    /// Extract the embedding for one face. Engine errors are folded into
    /// [`ExtractionFailure::Engine`]; this never panics or propagates.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<Embedding, ExtractionFailure> {
        let raw = self
            .engine
            .extract_feature(image, face)
            .map_err(|e| ExtractionFailure::Engine(e.to_string()))?;

        to_embedding(raw, self.expected_dim)
    }
}
