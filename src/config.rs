//! Training configuration surface
//!
//! Mirrors the flat option set of the reference training entry point: one
//! struct holding every recognized option, with fail-fast validation before
//! any I/O or model construction happens.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a single training run
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Training data directory, or a comma-separated list when
    /// --merge-datasets is enabled
    #[arg(long, default_value = "./train/")]
    pub data_dir: String,

    /// Output directory for checkpoints (created if absent)
    #[arg(long, default_value = "./models/")]
    pub output_dir: PathBuf,

    /// Filename prefix for checkpoint artifacts
    #[arg(long, default_value = "demo_model")]
    pub output_name_prefix: String,

    /// Number of training epochs
    #[arg(long, default_value_t = 3)]
    pub epochs: usize,

    /// Epoch checkpoint cadence
    #[arg(long, default_value_t = 1)]
    pub save_every_epochs: usize,

    /// Step checkpoint cadence for the rolling "latest" artifact
    #[arg(long, default_value_t = 10_000)]
    pub save_every_steps: usize,

    /// Disable step-cadence checkpoints entirely
    #[arg(long)]
    pub no_step_checkpoints: bool,

    /// Warmup steps for the learning-rate schedule
    #[arg(long, default_value_t = 500)]
    pub scheduler_warmup_steps: usize,

    /// Length of the mapped prefix in language-model embedding positions
    #[arg(long, default_value_t = 10)]
    pub prefix_length: usize,

    /// Dimensionality of the visual-prefix embedding
    #[arg(long, default_value_t = 768)]
    pub prefix_size: usize,

    /// Number of CLIP feature positions per sample
    #[arg(long, default_value_t = 10)]
    pub clip_prefix_length: usize,

    /// Language model family (gpt2, gptj, t0)
    #[arg(long, default_value = "gpt2")]
    pub language_model_type: String,

    /// Pretrained variant identifier within the family
    #[arg(long, default_value = "gpt2-xl")]
    pub language_model_variant: String,

    /// Batch size
    #[arg(long, default_value_t = 256)]
    pub batch_size: usize,

    /// Train only the mapping network, keeping the language model frozen
    #[arg(long)]
    pub prefix_only: bool,

    /// Mapping network strategy (mlp or transformer)
    #[arg(long, default_value = "transformer")]
    pub mapping_type: String,

    /// Number of mapping network layers
    #[arg(long, default_value_t = 8)]
    pub num_layers: usize,

    /// Number of mapping network attention heads
    #[arg(long, default_value_t = 8)]
    pub num_attention_heads: usize,

    /// L2-normalize visual prefixes at load time
    #[arg(long)]
    pub normalize_prefix: bool,

    /// Concatenate multiple data directories into one dataset
    #[arg(long)]
    pub merge_datasets: bool,

    /// Enable the deepspeed distributed strategy
    #[arg(long)]
    pub use_deepspeed: bool,

    /// Train in 16-bit precision
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub use_16bit_precision: bool,

    /// Device selection: a single ordinal, `-1` for all devices, or a
    /// comma-separated list of ordinals
    #[arg(long, default_value = "0")]
    pub gpu_devices: String,

    /// Deepspeed strategy identifier, passed through to the engine
    #[arg(long)]
    pub deepspeed_strategy: Option<String>,
}

impl TrainConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// The data directories this run reads from, split on commas when merge
    /// mode is enabled
    pub fn data_dirs(&self) -> Vec<String> {
        if self.merge_datasets {
            self.data_dir
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            vec![self.data_dir.clone()]
        }
    }

    /// Effective step checkpoint cadence; `None` disables step saves
    pub fn step_cadence(&self) -> Option<usize> {
        if self.no_step_checkpoints {
            None
        } else {
            Some(self.save_every_steps)
        }
    }

    /// Effective distributed strategy identifier.
    ///
    /// An explicit strategy wins; `--use-deepspeed` alone selects the stock
    /// deepspeed strategy rather than silently running non-distributed.
    pub fn strategy(&self) -> Option<String> {
        self.deepspeed_strategy
            .clone()
            .or_else(|| self.use_deepspeed.then(|| "deepspeed".to_string()))
    }

    /// Validate the configuration, failing before any I/O happens
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::config("epochs must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(Error::config("batch size must be greater than 0"));
        }

        if self.save_every_epochs == 0 {
            return Err(Error::config("save_every_epochs must be greater than 0"));
        }

        if !self.no_step_checkpoints && self.save_every_steps == 0 {
            return Err(Error::config(
                "save_every_steps must be greater than 0; \
                 use --no-step-checkpoints to disable step saves",
            ));
        }

        if self.prefix_length == 0 || self.clip_prefix_length == 0 {
            return Err(Error::config("prefix lengths must be greater than 0"));
        }

        if self.prefix_size == 0 {
            return Err(Error::config("prefix size must be greater than 0"));
        }

        if self.num_layers == 0 {
            return Err(Error::config("mapping network needs at least one layer"));
        }

        if self.num_attention_heads == 0 {
            return Err(Error::config("mapping network needs at least one attention head"));
        }

        if self.merge_datasets && self.data_dirs().len() < 2 {
            return Err(Error::config(
                "--merge-datasets was enabled, but less than 2 directories were specified; \
                 pass a comma-separated list to --data-dir",
            ));
        }

        Ok(())
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: "./train/".to_string(),
            output_dir: PathBuf::from("./models/"),
            output_name_prefix: "demo_model".to_string(),
            epochs: 3,
            save_every_epochs: 1,
            save_every_steps: 10_000,
            no_step_checkpoints: false,
            scheduler_warmup_steps: 500,
            prefix_length: 10,
            prefix_size: 768,
            clip_prefix_length: 10,
            language_model_type: "gpt2".to_string(),
            language_model_variant: "gpt2-xl".to_string(),
            batch_size: 256,
            prefix_only: false,
            mapping_type: "transformer".to_string(),
            num_layers: 8,
            num_attention_heads: 8,
            normalize_prefix: false,
            merge_datasets: false,
            use_deepspeed: false,
            use_16bit_precision: true,
            gpu_devices: "0".to_string(),
            deepspeed_strategy: None,
        }
    }
}
