//! Sequential batch loader handed to the training engine
//!
//! Deliberately simple: index order is dataset order. Shuffling, when a run
//! wants it, is an engine-side concern; this layer guarantees the dataset's
//! ordering invariant instead.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Dataset, PrefixSample};
use crate::error::Result;

/// Configuration for [`PrefixLoader`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Drop the last incomplete batch
    pub drop_last: bool,
}

impl Default for PrefixLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            drop_last: false,
        }
    }
}

/// Batch iterator over a dataset
pub struct PrefixLoader {
    dataset: Box<dyn Dataset>,
    config: PrefixLoaderConfig,
    cursor: usize,
}

impl PrefixLoader {
    /// Create a loader over a dataset
    pub fn new(dataset: Box<dyn Dataset>, config: PrefixLoaderConfig) -> Self {
        debug!(
            "Creating loader over '{}' with batch_size={}",
            dataset.metadata().name,
            config.batch_size
        );
        Self {
            dataset,
            config,
            cursor: 0,
        }
    }

    /// Number of samples in the underlying dataset
    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        if self.config.drop_last {
            len / self.config.batch_size
        } else {
            len.div_ceil(self.config.batch_size)
        }
    }

    /// Rewind to the start of the dataset for a new epoch
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Fetch the next batch, or `None` once the epoch is exhausted
    pub fn next_batch(&mut self) -> Result<Option<Vec<PrefixSample>>> {
        let len = self.dataset.len();
        if self.cursor >= len {
            return Ok(None);
        }

        let end = (self.cursor + self.config.batch_size).min(len);
        if self.config.drop_last && end - self.cursor < self.config.batch_size {
            return Ok(None);
        }

        let mut batch = Vec::with_capacity(end - self.cursor);
        for index in self.cursor..end {
            batch.push(self.dataset.get(index)?);
        }
        self.cursor = end;

        Ok(Some(batch))
    }
}
