//! Pool of fastembed model instances.
//!
//! `TextEmbedding::embed` needs `&mut self`, so a single instance would
//! serialize every caller. The pool holds several instances behind a bounded
//! channel; a caller borrows one for the duration of one batch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use rayon::prelude::*;

use super::{EmbeddingError, EmbeddingGenerator};

/// Texts per model call.
const MODEL_BATCH_SIZE: usize = 64;

/// Map a configured model name to a fastembed model.
pub fn parse_model(name: &str) -> Option<EmbeddingModel> {
    match name {
        "AllMiniLML6V2" | "all-MiniLM-L6-v2" => Some(EmbeddingModel::AllMiniLML6V2),
        "AllMiniLML12V2" | "all-MiniLM-L12-v2" => Some(EmbeddingModel::AllMiniLML12V2),
        "BGESmallENV15" | "bge-small-en-v1.5" => Some(EmbeddingModel::BGESmallENV15),
        "BGEBaseENV15" | "bge-base-en-v1.5" => Some(EmbeddingModel::BGEBaseENV15),
        "MultilingualE5Small" | "multilingual-e5-small" => {
            Some(EmbeddingModel::MultilingualE5Small)
        }
        _ => None,
    }
}

struct ModelInstance {
    model: TextEmbedding,
    id: usize,
}

/// Returns its instance to the pool when dropped, including on panic.
struct PooledModel<'a> {
    pool: &'a EmbeddingPool,
    instance: Option<ModelInstance>,
}

impl PooledModel<'_> {
    fn embed(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| EmbeddingError::Inference("model instance released".to_string()))?;
        instance
            .model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))
    }
}

impl Drop for PooledModel<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            let _ = self.pool.model_sender.send(instance);
        }
    }
}

/// Bounded pool of embedding model instances.
pub struct EmbeddingPool {
    model_sender: Sender<ModelInstance>,
    model_receiver: Receiver<ModelInstance>,
    pool_size: usize,
    dimensions: usize,
    model_name: String,
    usage_counters: Vec<AtomicUsize>,
}

impl EmbeddingPool {
    /// Load `pool_size` instances of `model`.
    ///
    /// Each instance of AllMiniLML6V2 takes roughly 90MB.
    pub fn new(
        pool_size: usize,
        model: EmbeddingModel,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> Result<Self, EmbeddingError> {
        let pool_size = pool_size.max(1);
        let (sender, receiver) = bounded(pool_size);
        let model_name = format!("{model:?}");

        tracing::info!(
            target: "embed",
            "Initializing embedding pool: {pool_size} instances ({model_name})"
        );

        let mut dimensions = 0;
        let usage_counters: Vec<AtomicUsize> =
            (0..pool_size).map(|_| AtomicUsize::new(0)).collect();

        for i in 0..pool_size {
            let mut text_model = TextEmbedding::try_new(
                InitOptions::new(model.clone())
                    .with_cache_dir(cache_dir.clone())
                    .with_show_download_progress(show_download_progress && i == 0),
            )
            .map_err(|e| {
                EmbeddingError::ModelInit(format!(
                    "Failed to initialize model instance {}: {e}",
                    i + 1
                ))
            })?;

            if i == 0 {
                dimensions = text_model
                    .embed(vec!["dimension probe"], None)
                    .map_err(|e| EmbeddingError::ModelInit(e.to_string()))?
                    .into_iter()
                    .next()
                    .map(|v| v.len())
                    .ok_or_else(|| {
                        EmbeddingError::ModelInit("model returned no probe embedding".to_string())
                    })?;
            }

            sender
                .send(ModelInstance {
                    model: text_model,
                    id: i,
                })
                .map_err(|_| EmbeddingError::ModelInit("embedding pool closed".to_string()))?;
        }

        tracing::info!(
            target: "embed",
            "Embedding pool ready: {pool_size} instances, {dimensions} dimensions"
        );

        Ok(Self {
            model_sender: sender,
            model_receiver: receiver,
            pool_size,
            dimensions,
            model_name,
            usage_counters,
        })
    }

    /// Borrow a model, blocking until one is free.
    fn acquire(&self) -> Result<PooledModel<'_>, EmbeddingError> {
        let instance = self
            .model_receiver
            .recv()
            .map_err(|_| EmbeddingError::Inference("embedding pool closed".to_string()))?;
        self.usage_counters[instance.id].fetch_add(1, Ordering::Relaxed);
        Ok(PooledModel {
            pool: self,
            instance: Some(instance),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Log how often each instance was used.
    pub fn log_usage_stats(&self) {
        let counts: Vec<usize> = self
            .usage_counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total: usize = counts.iter().sum();

        if total > 0 {
            let usage: Vec<String> = counts
                .iter()
                .enumerate()
                .map(|(i, c)| format!("model[{i}]={c}"))
                .collect();
            tracing::info!(
                target: "embed",
                "Embedding pool usage: {} (total: {total})",
                usage.join(", ")
            );
        }
    }
}

impl EmbeddingGenerator for EmbeddingPool {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    /// Splits the input into model-sized batches spread across the pool.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let batches: Vec<Vec<Vec<f32>>> = texts
            .par_chunks(MODEL_BATCH_SIZE)
            .map(|batch| self.acquire()?.embed(batch))
            .collect::<Result<_, _>>()?;
        Ok(batches.into_iter().flatten().collect())
    }
}

impl Drop for EmbeddingPool {
    fn drop(&mut self) {
        self.log_usage_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_names() {
        assert!(matches!(
            parse_model("AllMiniLML6V2"),
            Some(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_model("bge-small-en-v1.5"),
            Some(EmbeddingModel::BGESmallENV15)
        ));
        assert!(parse_model("gpt").is_none());
    }

    #[test]
    #[ignore = "Downloads model (~90MB)"]
    fn test_pool_embeds_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = EmbeddingPool::new(2, EmbeddingModel::AllMiniLML6V2, dir.path().into(), false)
            .unwrap();
        assert_eq!(pool.dimension(), 384);

        let texts: Vec<String> = (0..130).map(|i| format!("part number P-{i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let all = pool.embed(&refs).unwrap();
        let single = pool.embed(&refs[129..]).unwrap();
        assert_eq!(all.len(), 130);
        assert_eq!(all[129], single[0]);
    }
}
