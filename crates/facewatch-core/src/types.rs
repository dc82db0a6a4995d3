use serde::{Deserialize, Serialize};

/// Label reported for a face that matched no enrolled person.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Added to norms before dividing so zero vectors never produce NaN.
pub const NORM_EPSILON: f32 = 1e-6;

/// Axis-aligned face box in pixel coordinates: `(x1, y1)` top-left inclusive,
/// `(x2, y2)` bottom-right exclusive.
///
/// Serializes as `[x1, y1, x2, y2]`, the layout used by the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from floating-point detector coordinates, rounding outward-in.
    pub fn from_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.floor() as i32,
            y1: y1.floor() as i32,
            x2: x2.ceil() as i32,
            y2: y2.ceil() as i32,
        }
    }

    /// Clamp to `[0, width] x [0, height]`. Coordinates are never negative
    /// afterwards, and an inverted box collapses to zero area.
    pub fn clamp(&self, width: u32, height: u32) -> Self {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;
        let x1 = self.x1.clamp(0, w);
        let y1 = self.y1.clamp(0, h);
        Self {
            x1,
            y1,
            x2: self.x2.clamp(x1, w),
            y2: self.y2.clamp(y1, h),
        }
    }

    pub fn width(&self) -> u32 {
        (i64::from(self.x2) - i64::from(self.x1)).clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn height(&self) -> u32 {
        (i64::from(self.y2) - i64::from(self.y1)).clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// A face region reported by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// L2-normalize `values`, dividing by `norm + NORM_EPSILON`.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    values.iter().map(|x| x / (norm + NORM_EPSILON)).collect()
}

/// Cosine similarity of two vectors, clamped to [-1, 1].
///
/// The denominator carries `NORM_EPSILON`, so a zero vector scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt() + NORM_EPSILON);
    sim.clamp(-1.0, 1.0)
}

/// Face embedding vector, always held in L2-normalized form.
///
/// The only constructor normalizes, so every stored or compared embedding
/// is unit length (up to epsilon).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalize `raw` into an embedding. Returns `None` for an empty vector.
    pub fn from_raw(raw: &[f32]) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self {
            values: normalize(raw),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// A detected face with its embedding, if extraction succeeded.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Option<Embedding>,
}

/// Outcome of matching one embedding against the reference store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Person name, or [`UNKNOWN_LABEL`].
    pub label: String,
    /// Best similarity observed, kept even when the label is unknown.
    pub score: f32,
}

impl MatchResult {
    pub fn unknown(score: f32) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            score,
        }
    }

    pub fn is_known(&self) -> bool {
        self.label != UNKNOWN_LABEL
    }
}

/// One annotated detection as published to readers of the frame state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceResult {
    pub name: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl FaceResult {
    pub fn new(bbox: BoundingBox, result: MatchResult) -> Self {
        Self {
            name: result.label,
            score: result.score,
            bbox,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_LABEL
    }
}
