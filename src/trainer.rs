//! Run orchestration: configuration in, completed training run out
//!
//! The orchestrator turns a validated [`TrainConfig`] into datasets, a
//! model, a checkpoint saver, and run settings, then hands the loop to a
//! [`TrainingEngine`]. Validation happens before any filesystem effect, so a
//! misconfigured run leaves nothing behind.

use candle_core::Device;
use tracing::info;

use crate::checkpoint::CheckpointSaver;
use crate::config::TrainConfig;
use crate::data::{
    CompositeDataset, Dataset, PrefixDataset, PrefixDatasetOptions, PrefixLoader,
    PrefixLoaderConfig,
};
use crate::device::DeviceSelection;
use crate::engine::{FitReport, Precision, RunSettings, TrainingEngine};
use crate::error::Result;
use crate::model::{CaptionModelConfig, ModelFactory};

/// Total optimizer steps a warmup schedule spans, recomputed from its
/// operands wherever it is needed
pub fn total_steps(dataset_len: usize, epochs: usize) -> usize {
    dataset_len * epochs
}

/// Drives a full training run from a validated configuration
pub struct TrainingOrchestrator {
    config: TrainConfig,
}

impl TrainingOrchestrator {
    /// Create an orchestrator, validating the configuration up front.
    ///
    /// Merge misconfiguration and invalid cadences fail here, before any
    /// dataset or output-directory I/O.
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The validated configuration this run uses
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn build_dataset(&self, device: &Device) -> Result<Box<dyn Dataset>> {
        let options = PrefixDatasetOptions {
            normalize_prefix: self.config.normalize_prefix,
            ..PrefixDatasetOptions::default()
        };

        let dirs = self.config.data_dirs();
        if self.config.merge_datasets {
            let mut members: Vec<Box<dyn Dataset>> = Vec::with_capacity(dirs.len());
            for dir in &dirs {
                members.push(Box::new(PrefixDataset::load(
                    dir,
                    device.clone(),
                    options.clone(),
                )?));
            }
            Ok(Box::new(CompositeDataset::merge(members)?))
        } else {
            Ok(Box::new(PrefixDataset::load(
                &dirs[0],
                device.clone(),
                options,
            )?))
        }
    }

    /// Run the configured training job on the given engine
    pub fn run(&self, engine: &mut dyn TrainingEngine) -> Result<FitReport> {
        let devices = DeviceSelection::parse(&self.config.gpu_devices)?;
        let device = devices.primary_device()?;

        let dataset = self.build_dataset(&device)?;
        let dataset_len = dataset.len();
        let run_steps = total_steps(dataset_len, self.config.epochs);
        info!(
            "Training over {dataset_len} samples for {} epochs ({run_steps} total steps)",
            self.config.epochs
        );

        let model_config = CaptionModelConfig::from_flags(
            self.config.prefix_only,
            &self.config.language_model_type,
            &self.config.language_model_variant,
            &self.config.mapping_type,
            self.config.clip_prefix_length,
            self.config.prefix_size,
            self.config.prefix_length,
            self.config.num_layers,
            self.config.num_attention_heads,
        )?;
        let model = ModelFactory::build(&model_config, &device)?;

        let saver = CheckpointSaver::new(
            &self.config.output_dir,
            &self.config.output_name_prefix,
            self.config.save_every_epochs,
            self.config.step_cadence(),
        )?;

        let mut loader = PrefixLoader::new(
            dataset,
            PrefixLoaderConfig {
                batch_size: self.config.batch_size,
                drop_last: false,
            },
        );

        let strategy = self.config.strategy();
        if self.config.use_deepspeed && self.config.deepspeed_strategy.is_none() {
            info!("Deepspeed requested without an explicit strategy, using \"deepspeed\"");
        }
        let settings = RunSettings {
            max_epochs: self.config.epochs,
            devices,
            precision: Precision::from_16bit_flag(self.config.use_16bit_precision),
            strategy,
            total_steps: total_steps(dataset_len, self.config.epochs),
            warmup_steps: self.config.scheduler_warmup_steps,
        };

        let report = engine.fit(&model, &mut loader, &[&saver], &settings)?;

        saver.save_final(
            self.config.epochs.saturating_sub(1),
            report.global_steps,
            &model,
        )?;
        info!(
            "Run complete: {} epochs, {} steps",
            report.epochs_completed, report.global_steps
        );

        Ok(report)
    }
}
