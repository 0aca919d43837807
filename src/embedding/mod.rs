//! Embedding generation.
//!
//! [`SharedEmbedder`] is the process-wide handle: it loads the configured
//! model once, on first use, and normalizes every vector it returns.

mod hash;
mod pool;

pub use hash::HashEmbedder;
pub use pool::{EmbeddingPool, parse_model};

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::EmbeddingConfig;
use crate::log_event;

/// Model name selecting the offline feature-hashing generator.
pub const HASH_MODEL: &str = "hash";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Failed to initialize embedding model: {0}")]
    ModelInit(String),

    #[error("Unknown embedding model: {0}")]
    UnknownModel(String),

    #[error("Failed to generate embedding: {0}")]
    Inference(String),

    #[error("Expected {expected} embeddings, model returned {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Input {0} is empty")]
    EmptyText(usize),

    #[error("Input {0} produced a zero vector")]
    ZeroVector(usize),
}

impl EmbeddingError {
    /// Whether retrying the same batch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::ModelInit(_) | EmbeddingError::Inference(_))
    }
}

/// A model turning text into fixed-length vectors.
pub trait EmbeddingGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// One vector per input, in input order.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

type GeneratorFactory =
    Box<dyn Fn() -> Result<Arc<dyn EmbeddingGenerator>, EmbeddingError> + Send + Sync>;

/// Lazily loaded, shared embedding model.
///
/// The factory runs at most once successfully, even under concurrent first
/// use. After that, calls go straight to the loaded generator without
/// taking any lock.
pub struct SharedEmbedder {
    factory: GeneratorFactory,
    instance: OnceLock<Arc<dyn EmbeddingGenerator>>,
    init_lock: Mutex<()>,
    loads: AtomicUsize,
}

impl std::fmt::Debug for SharedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEmbedder")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl SharedEmbedder {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EmbeddingGenerator>, EmbeddingError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            instance: OnceLock::new(),
            init_lock: Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Build from configuration. The model name is checked now; the model is
    /// loaded on first use.
    pub fn from_config(config: &EmbeddingConfig, data_dir: &Path) -> Result<Self, EmbeddingError> {
        if config.model.eq_ignore_ascii_case(HASH_MODEL) {
            let dimension = config.hash_dimension;
            return Ok(Self::new(move || {
                Ok(Arc::new(HashEmbedder::new(dimension)) as Arc<dyn EmbeddingGenerator>)
            }));
        }

        let model = parse_model(&config.model)
            .ok_or_else(|| EmbeddingError::UnknownModel(config.model.clone()))?;
        let pool_size = config.pool_size;
        let cache_dir = config.cache_dir_or(data_dir);
        let show_progress = config.show_download_progress;

        Ok(Self::new(move || {
            let pool = EmbeddingPool::new(pool_size, model.clone(), cache_dir.clone(), show_progress)?;
            Ok(Arc::new(pool) as Arc<dyn EmbeddingGenerator>)
        }))
    }

    pub fn is_loaded(&self) -> bool {
        self.instance.get().is_some()
    }

    /// Number of times the model has been loaded (0 or 1).
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }

    /// The loaded generator, loading it if needed.
    pub fn generator(&self) -> Result<&Arc<dyn EmbeddingGenerator>, EmbeddingError> {
        if let Some(generator) = self.instance.get() {
            return Ok(generator);
        }

        let _guard = self.init_lock.lock();
        if let Some(generator) = self.instance.get() {
            return Ok(generator);
        }

        let generator = (self.factory)()?;
        log_event!(
            "embed",
            "model loaded",
            "{} ({} dimensions)",
            generator.model_name(),
            generator.dimension()
        );
        self.loads.fetch_add(1, Ordering::Release);
        Ok(self.instance.get_or_init(|| generator))
    }

    pub fn dimension(&self) -> Result<usize, EmbeddingError> {
        Ok(self.generator()?.dimension())
    }

    /// Unit-length vectors, one per input, in input order.
    ///
    /// An empty input returns an empty output without loading the model.
    pub fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(index) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyText(index));
        }

        let generator = self.generator()?;
        let expected = generator.dimension();
        let mut vectors = generator.embed(texts)?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        for (index, vector) in vectors.iter_mut().enumerate() {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            if !normalize(vector) {
                return Err(EmbeddingError::ZeroVector(index));
            }
        }
        Ok(vectors)
    }

    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(&[text])?
            .pop()
            .ok_or(EmbeddingError::CountMismatch {
                expected: 1,
                actual: 0,
            })
    }
}

/// Scale `vector` to unit length. Returns false for a zero vector.
pub fn normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    true
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
