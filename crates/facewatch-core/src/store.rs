//! Reference store: enrolled persons and their reference embeddings.
//!
//! The store is built from a directory tree (`root/<person>/<image>`) and
//! published as an immutable [`Gallery`] snapshot behind an `Arc`. Matchers
//! clone the `Arc` and work lock-free; `reload()` builds a complete new
//! gallery off to the side and swaps it in under a short write lock.

use crate::embedding::{EmbeddingExtractor, ExtractionFailure};
use crate::engine::{FaceDetector, FeatureEngine};
use crate::types::Embedding;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Accepted reference image extensions (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("reference directory not found: {0}")]
    RootMissing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reference loader poisoned by an earlier panic")]
    Poisoned,
}

/// True if `path` has one of the accepted image extensions.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

/// Immutable mapping from person name to reference embeddings.
///
/// Ordered by name so matching and listings are deterministic.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    persons: BTreeMap<String, Vec<Embedding>>,
}

/// Per-person diagnostic entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonSummary {
    pub name: String,
    pub embeddings: usize,
}

impl Gallery {
    pub fn insert_person(&mut self, name: impl Into<String>, embeddings: Vec<Embedding>) {
        self.persons.insert(name.into(), embeddings);
    }

    pub fn persons(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.persons.iter().map(|(n, e)| (n.as_str(), e.as_slice()))
    }

    pub fn get(&self, name: &str) -> Option<&[Embedding]> {
        self.persons.get(name).map(Vec::as_slice)
    }

    /// Number of persons, including those without embeddings.
    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.persons.values().map(Vec::len).sum()
    }

    /// True if at least one person can contribute to matching.
    pub fn is_usable(&self) -> bool {
        self.persons.values().any(|e| !e.is_empty())
    }

    pub fn summary(&self) -> Vec<PersonSummary> {
        self.persons
            .iter()
            .map(|(name, e)| PersonSummary {
                name: name.clone(),
                embeddings: e.len(),
            })
            .collect()
    }
}

/// Counts of what a build saw and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub persons: usize,
    pub embeddings: usize,
    pub unreadable: usize,
    pub no_face: usize,
    pub multiple_faces: usize,
    pub detection_failed: usize,
    pub extraction_failed: usize,
    /// Persons that ended up with no usable embedding.
    pub empty_persons: Vec<String>,
}

enum Skip {
    Unreadable(image::ImageError),
    Detection(String),
    NoFace,
    MultipleFaces(usize),
    Extraction(ExtractionFailure),
}

/// Owns the engines used to turn reference images into embeddings.
pub struct ReferenceLoader {
    detector: Box<dyn FaceDetector>,
    extractor: EmbeddingExtractor<Box<dyn FeatureEngine>>,
}

impl ReferenceLoader {
    pub fn new(detector: Box<dyn FaceDetector>, engine: Box<dyn FeatureEngine>) -> Self {
        Self {
            detector,
            extractor: EmbeddingExtractor::new(engine),
        }
    }

    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.extractor = self.extractor.with_expected_dim(dim);
        self
    }

    /// Scan `root` and build a fresh gallery. Only a missing or unreadable
    /// root fails the build; bad images and person directories are skipped.
    pub fn build(&mut self, root: &Path) -> Result<(Gallery, BuildReport), StoreError> {
        if !root.is_dir() {
            return Err(StoreError::RootMissing(root.to_path_buf()));
        }

        let mut person_dirs: Vec<PathBuf> = std::fs::read_dir(root)
            .map_err(|source| StoreError::Io {
                path: root.to_path_buf(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_dir())
            .collect();
        person_dirs.sort();

        let mut gallery = Gallery::default();
        let mut report = BuildReport::default();

        for dir in person_dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                tracing::warn!(
                    path = %dir.display(),
                    "skipping person directory with non-UTF-8 name"
                );
                continue;
            };

            tracing::info!(person = %name, "loading reference faces");
            let embeddings = self.load_person(&dir, &mut report);

            if embeddings.is_empty() {
                tracing::warn!(person = %name, "no valid embeddings for person");
                report.empty_persons.push(name.clone());
            }
            report.persons += 1;
            report.embeddings += embeddings.len();
            gallery.insert_person(name, embeddings);
        }

        Ok((gallery, report))
    }

    fn load_person(&mut self, dir: &Path, report: &mut BuildReport) -> Vec<Embedding> {
        let mut images: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_image_file(p))
                .collect(),
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot list person directory");
                return Vec::new();
            }
        };
        images.sort();

        let mut embeddings = Vec::with_capacity(images.len());
        for path in images {
            match self.embed_image(&path) {
                Ok(embedding) => {
                    tracing::debug!(path = %path.display(), "reference face added");
                    embeddings.push(embedding);
                }
                Err(Skip::Unreadable(e)) => {
                    report.unreadable += 1;
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        reason = "unreadable",
                        "skipping image"
                    );
                }
                Err(Skip::Detection(e)) => {
                    report.detection_failed += 1;
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        reason = "detection_failed",
                        "skipping image"
                    );
                }
                Err(Skip::NoFace) => {
                    report.no_face += 1;
                    tracing::warn!(path = %path.display(), reason = "no_face", "skipping image");
                }
                Err(Skip::MultipleFaces(count)) => {
                    report.multiple_faces += 1;
                    tracing::warn!(
                        path = %path.display(),
                        count,
                        reason = "multiple_faces",
                        "skipping image"
                    );
                }
                Err(Skip::Extraction(e)) => {
                    report.extraction_failed += 1;
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        reason = e.reason(),
                        "skipping image"
                    );
                }
            }
        }
        embeddings
    }

    fn embed_image(&mut self, path: &Path) -> Result<Embedding, Skip> {
        let image = image::open(path).map_err(Skip::Unreadable)?.to_rgb8();

        let faces: Vec<_> = self
            .detector
            .detect(&image)
            .map_err(|e| Skip::Detection(e.to_string()))?
            .into_iter()
            .filter(|f| !f.bbox.is_empty())
            .collect();

        match faces.as_slice() {
            [] => Err(Skip::NoFace),
            [face] => self.extractor.extract(&image, face).map_err(Skip::Extraction),
            many => Err(Skip::MultipleFaces(many.len())),
        }
    }
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub generation: u64,
    pub report: BuildReport,
}

/// The live reference store shared by the pipeline and API handlers.
pub struct ReferenceStore {
    root: PathBuf,
    /// Serializes rebuilds; also owns the engines they use.
    loader: Mutex<ReferenceLoader>,
    active: RwLock<Arc<Gallery>>,
    generation: AtomicU64,
}

impl ReferenceStore {
    /// Create an empty store rooted at `root`. Call [`reload`](Self::reload)
    /// to populate it.
    pub fn new(root: impl Into<PathBuf>, loader: ReferenceLoader) -> Self {
        Self {
            root: root.into(),
            loader: Mutex::new(loader),
            active: RwLock::new(Arc::new(Gallery::default())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The currently published gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        // The guarded value is only ever replaced whole, so a poisoned
        // lock still holds a complete gallery.
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful publishes since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> Vec<PersonSummary> {
        self.snapshot().summary()
    }

    /// Rebuild from disk and publish atomically. On failure the previous
    /// gallery stays active.
    pub fn reload(&self) -> Result<ReloadSummary, StoreError> {
        let mut loader = self.loader.lock().map_err(|_| StoreError::Poisoned)?;

        tracing::info!(root = %self.root.display(), "reloading reference faces");
        let (gallery, report) = match loader.build(&self.root) {
            Ok(built) => built,
            Err(e) => {
                tracing::error!(error = %e, "reference reload failed; keeping previous mapping");
                return Err(e);
            }
        };

        let generation = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            *active = Arc::new(gallery);
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        tracing::info!(
            generation,
            persons = report.persons,
            embeddings = report.embeddings,
            skipped = report.unreadable
                + report.no_face
                + report.multiple_faces
                + report.detection_failed
                + report.extraction_failed,
            "reference faces loaded"
        );

        Ok(ReloadSummary { generation, report })
    }
}
