//! Dataset composition for precomputed visual-prefix / token pairs
//!
//! Sources are directories of precomputed CLIP-prefix embeddings paired with
//! caption token sequences. A run trains on either a single source or an
//! ordered concatenation of several; cross-member ordering is exactly the
//! construction order, and no shuffling happens at this layer.

use candle_core::Tensor;

use crate::error::Result;

pub mod datasets;
pub mod loaders;

// Re-exports
pub use datasets::{CompositeDataset, PrefixDataset, PrefixDatasetOptions};
pub use loaders::{PrefixLoader, PrefixLoaderConfig};

/// Common trait for training datasets
pub trait Dataset: Send + Sync {
    /// Number of samples in the dataset
    fn len(&self) -> usize;

    /// Whether the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<PrefixSample>;

    /// Dataset metadata
    fn metadata(&self) -> &DatasetMetadata;
}

/// A single (visual-prefix embedding, token sequence) pair
#[derive(Debug, Clone)]
pub struct PrefixSample {
    /// Unique identifier for the sample
    pub id: String,
    /// Visual-prefix embedding, shape `[clip_prefix_length, prefix_size]`
    pub prefix: Tensor,
    /// Caption token ids, shape `[seq_len]`
    pub tokens: Tensor,
    /// Attention mask over token positions, shape `[seq_len]`; zero marks
    /// padding
    pub mask: Tensor,
}

/// Dataset metadata
#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    /// Dataset name/identifier
    pub name: String,
    /// Number of samples
    pub num_samples: usize,
    /// Dimensionality of the visual-prefix embeddings
    pub prefix_size: usize,
}
