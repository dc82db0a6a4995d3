//! facewatch-core: embedding matching engine.
//!
//! Turns detector/feature-engine output into normalized embeddings, holds
//! the enrolled reference store, and matches probes against it. SCRFD and
//! ArcFace ONNX models provide the default engines.

pub mod detector;
pub mod embedding;
pub mod engine;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use detector::ScrfdDetector;
pub use embedding::{EmbeddingExtractor, ExtractionFailure, RawFeature};
pub use engine::{FaceDetector, FeatureEngine};
pub use matcher::{CosineMatcher, Matcher};
pub use recognizer::ArcFaceEngine;
pub use store::{Gallery, ReferenceLoader, ReferenceStore, StoreError};
pub use types::{
    BoundingBox, DetectedFace, Embedding, FaceRegion, FaceResult, MatchResult, UNKNOWN_LABEL,
};
