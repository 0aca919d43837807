//! Pipeline configuration
//!
//! Batching, backpressure and retry schedules for one file's ingestion.
//! Reads from Settings (.sheetdex/settings.toml).

use std::time::Duration;

use crate::Settings;
use crate::parsing::ParseOptions;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records per parse → embed → index batch.
    pub batch_size: usize,

    /// Parsed batches allowed to wait for the embed/index stage.
    pub channel_capacity: usize,

    pub parse: ParseOptions,

    /// Retries for a failed embedding call.
    pub embed_retry: RetryPolicy,

    /// Retries for a failed index write.
    pub index_retry: RetryPolicy,

    /// Remove a failed file's partial documents from the index.
    pub purge_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineConfig {
    /// Create config from Settings.
    ///
    /// - `parsing.batch_size` -> batch_size
    /// - `parsing.channel_capacity` -> channel_capacity
    /// - `embedding.max_retries`, `embedding.retry_backoff_ms` -> embed_retry
    /// - `index.*` -> index_retry, purge_on_failure
    pub fn from_settings(settings: &Settings) -> Self {
        let embedding = &settings.embedding;
        let backoff = Duration::from_millis(embedding.retry_backoff_ms);

        Self {
            batch_size: settings.parsing.batch_size.max(1),
            channel_capacity: settings.parsing.channel_capacity.max(1),
            parse: ParseOptions::from_config(&settings.parsing),
            embed_retry: RetryPolicy::new(embedding.max_retries, backoff, backoff * 8),
            index_retry: RetryPolicy::from_config(&settings.index),
            purge_on_failure: settings.index.purge_on_failure,
        }
    }

    /// Small batches and no retry delays, for tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 64,
            channel_capacity: 2,
            parse: ParseOptions {
                progress_interval: 100,
                ..ParseOptions::default()
            },
            embed_retry: RetryPolicy::immediate(2),
            index_retry: RetryPolicy::immediate(3),
            purge_on_failure: true,
        }
    }
}
