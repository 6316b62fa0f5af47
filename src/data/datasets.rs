//! Dataset implementations for prefix-captioning training

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, D};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Dataset, DatasetMetadata, PrefixSample};
use crate::error::{Error, Result};

/// Options for loading a single-source prefix dataset
#[derive(Debug, Clone)]
pub struct PrefixDatasetOptions {
    /// L2-normalize each prefix row at load time
    pub normalize_prefix: bool,
    /// Keep loaded samples in memory
    pub cache_in_memory: bool,
}

impl Default for PrefixDatasetOptions {
    fn default() -> Self {
        Self {
            normalize_prefix: false,
            cache_in_memory: true,
        }
    }
}

/// Manifest file structure for a prefix dataset directory
#[derive(Debug, Serialize, Deserialize)]
struct PrefixManifest {
    /// Dataset name
    name: String,
    /// Dimensionality of the visual-prefix embeddings
    prefix_size: usize,
    /// Sample entries, in dataset order
    samples: Vec<SampleInfo>,
}

/// Manifest entry for a single sample
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SampleInfo {
    /// Sample ID
    id: String,
    /// Safetensors file path relative to the dataset directory
    file: String,
}

/// One source directory of precomputed (visual-prefix, token-sequence) pairs.
///
/// Immutable once loaded. Each sample file is a safetensors archive holding a
/// `"prefix"` tensor and a `"tokens"` tensor.
pub struct PrefixDataset {
    metadata: DatasetMetadata,
    data_path: PathBuf,
    device: Device,
    options: PrefixDatasetOptions,
    samples: Vec<SampleInfo>,
    cache: Arc<RwLock<HashMap<usize, PrefixSample>>>,
}

impl PrefixDataset {
    /// Load a prefix dataset from a source directory
    pub fn load(
        data_path: impl AsRef<Path>,
        device: Device,
        options: PrefixDatasetOptions,
    ) -> Result<Self> {
        let data_path = data_path.as_ref().to_path_buf();

        info!("Loading prefix dataset from {:?}", data_path);

        let manifest_path = data_path.join("manifest.json");
        if !manifest_path.exists() {
            return Err(Error::dataset(format!(
                "no manifest.json in {}",
                data_path.display()
            )));
        }

        let manifest_str = std::fs::read_to_string(&manifest_path)?;
        let manifest: PrefixManifest = serde_json::from_str(&manifest_str)?;

        let metadata = DatasetMetadata {
            name: manifest.name.clone(),
            num_samples: manifest.samples.len(),
            prefix_size: manifest.prefix_size,
        };

        info!(
            "Loaded prefix dataset '{}' with {} samples",
            metadata.name, metadata.num_samples
        );

        Ok(Self {
            metadata,
            data_path,
            device,
            options,
            samples: manifest.samples,
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Load the tensors for one sample from its safetensors file
    fn load_sample(&self, index: usize) -> Result<PrefixSample> {
        let info = &self.samples[index];
        let file_path = self.data_path.join(&info.file);
        debug!("Loading sample {} ({})", index, info.id);

        let tensors = candle_core::safetensors::load(&file_path, &self.device)?;

        let prefix = tensors
            .get("prefix")
            .ok_or_else(|| {
                Error::dataset(format!("sample '{}' has no 'prefix' tensor", info.id))
            })?
            .clone();
        let tokens = tensors
            .get("tokens")
            .ok_or_else(|| {
                Error::dataset(format!("sample '{}' has no 'tokens' tensor", info.id))
            })?
            .clone();

        let prefix = if self.options.normalize_prefix {
            l2_normalize(&prefix)?
        } else {
            prefix
        };

        // Token id 0 is the padding token.
        let mask = tokens.ne(0u32)?.to_dtype(DType::F32)?;

        Ok(PrefixSample {
            id: info.id.clone(),
            prefix,
            tokens,
            mask,
        })
    }
}

/// L2-normalize along the last dimension
fn l2_normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(t.broadcast_div(&norm)?)
}

impl Dataset for PrefixDataset {
    fn len(&self) -> usize {
        self.metadata.num_samples
    }

    fn get(&self, index: usize) -> Result<PrefixSample> {
        if index >= self.len() {
            return Err(Error::dataset(format!(
                "invalid sample index {index} >= {}",
                self.len()
            )));
        }

        if let Some(sample) = self.cache.read().get(&index) {
            debug!("Retrieved sample {} from cache", index);
            return Ok(sample.clone());
        }

        let sample = self.load_sample(index)?;

        if self.options.cache_in_memory {
            self.cache.write().insert(index, sample.clone());
        }

        Ok(sample)
    }

    fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }
}

/// Ordered concatenation of at least two member datasets.
///
/// A global index resolves to exactly one member and a local offset through
/// cumulative-length boundaries fixed at construction time; cross-member
/// ordering is the construction order.
pub struct CompositeDataset {
    metadata: DatasetMetadata,
    members: Vec<Box<dyn Dataset>>,
    /// `boundaries[k]` is the number of samples in members `0..=k`
    boundaries: Vec<usize>,
}

impl CompositeDataset {
    /// Merge several datasets into one logical dataset.
    ///
    /// Fails with a configuration error when fewer than two members are
    /// supplied or when member prefix sizes disagree.
    pub fn merge(members: Vec<Box<dyn Dataset>>) -> Result<Self> {
        if members.len() < 2 {
            return Err(Error::config(format!(
                "dataset merge requires at least 2 members, got {}",
                members.len()
            )));
        }

        let prefix_size = members[0].metadata().prefix_size;
        for member in &members[1..] {
            let meta = member.metadata();
            if meta.prefix_size != prefix_size {
                return Err(Error::config(format!(
                    "dataset merge requires matching prefix sizes: '{}' has {} but '{}' has {}",
                    members[0].metadata().name,
                    prefix_size,
                    meta.name,
                    meta.prefix_size
                )));
            }
        }

        let mut boundaries = Vec::with_capacity(members.len());
        let mut total = 0;
        for member in &members {
            total += member.len();
            boundaries.push(total);
        }

        let names: Vec<&str> = members
            .iter()
            .map(|m| m.metadata().name.as_str())
            .collect();
        let metadata = DatasetMetadata {
            name: names.join("+"),
            num_samples: total,
            prefix_size,
        };

        info!(
            "Merged {} datasets into '{}' with {} samples",
            members.len(),
            metadata.name,
            total
        );

        Ok(Self {
            metadata,
            members,
            boundaries,
        })
    }

    /// Resolve a global index to `(member index, local index)`
    fn resolve(&self, index: usize) -> (usize, usize) {
        let member = self.boundaries.partition_point(|&b| b <= index);
        let offset = if member == 0 {
            0
        } else {
            self.boundaries[member - 1]
        };
        (member, index - offset)
    }
}

impl Dataset for CompositeDataset {
    fn len(&self) -> usize {
        self.metadata.num_samples
    }

    fn get(&self, index: usize) -> Result<PrefixSample> {
        if index >= self.len() {
            return Err(Error::dataset(format!(
                "invalid sample index {index} >= {}",
                self.len()
            )));
        }

        let (member, local) = self.resolve(index);
        self.members[member].get(local)
    }

    fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }
}
