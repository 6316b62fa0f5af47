//! Training engine boundary
//!
//! The engine owns the iterative loop; everything the lifecycle needs from it
//! flows through two synchronous events, epoch end and step end, each handed
//! the current recoverable state explicitly. [`LocalEngine`] is the
//! single-process reference engine; distributed engines plug in behind the
//! same trait.

use tracing::{debug, info};

use crate::checkpoint::Checkpointable;
use crate::data::PrefixLoader;
use crate::device::DeviceSelection;
use crate::error::Result;
use crate::model::CaptionModel;

/// Floating-point precision of the training run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// 16-bit mixed precision
    Half,
    /// Full 32-bit precision
    Full,
}

impl Precision {
    /// Map the 16-bit flag onto a precision
    pub fn from_16bit_flag(use_16bit: bool) -> Self {
        if use_16bit {
            Self::Half
        } else {
            Self::Full
        }
    }
}

/// Everything an engine needs to know about the run, resolved up front
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Number of epochs to run
    pub max_epochs: usize,
    /// Accelerator selection
    pub devices: DeviceSelection,
    /// Floating-point precision
    pub precision: Precision,
    /// Distributed strategy identifier, when one applies
    pub strategy: Option<String>,
    /// Total optimizer steps the schedule spans
    pub total_steps: usize,
    /// Linear warmup steps at the start of the schedule
    pub warmup_steps: usize,
}

impl RunSettings {
    /// Learning-rate scale at a given global step under linear warmup
    pub fn warmup_factor(&self, global_step: usize) -> f64 {
        if self.warmup_steps == 0 || global_step >= self.warmup_steps {
            1.0
        } else {
            global_step as f64 / self.warmup_steps as f64
        }
    }
}

/// Outcome of a completed fit
#[derive(Debug, Clone)]
pub struct FitReport {
    /// Epochs completed
    pub epochs_completed: usize,
    /// Total completed batches across the run
    pub global_steps: usize,
    /// Loss of the last batch, when at least one batch ran
    pub final_loss: Option<f32>,
}

/// Observer of engine lifecycle events.
///
/// The recoverable state is a parameter of every event rather than something
/// the observer reaches back into the engine for, so observers stay testable
/// in isolation.
pub trait EngineCallback {
    /// Fired after each epoch completes; `epoch` is 0-based and
    /// `global_step` is the run-wide count of completed batches at that
    /// point
    fn on_epoch_end(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()>;

    /// Fired after each completed batch; `epoch` is the epoch the batch
    /// belongs to and `global_step` counts completed batches from the start
    /// of the run
    fn on_step_end(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()>;
}

impl EngineCallback for crate::checkpoint::CheckpointSaver {
    fn on_epoch_end(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()> {
        crate::checkpoint::CheckpointSaver::on_epoch_end(self, epoch, global_step, state)
    }

    fn on_step_end(
        &self,
        epoch: usize,
        global_step: usize,
        state: &dyn Checkpointable,
    ) -> Result<()> {
        crate::checkpoint::CheckpointSaver::on_step_end(self, epoch, global_step, state)
    }
}

/// Owner of the iterative training loop
pub trait TrainingEngine {
    /// Drive the full run, firing callbacks synchronously after each batch
    /// and each epoch
    fn fit(
        &mut self,
        model: &CaptionModel,
        loader: &mut PrefixLoader,
        callbacks: &[&dyn EngineCallback],
        settings: &RunSettings,
    ) -> Result<FitReport>;
}

/// Single-process engine driving forward passes on the local device.
///
/// Gradient updates are the runtime's business and stay outside this loop;
/// the loop's contract is ordering: every step event fires after its batch
/// and before the next one, every epoch event fires after the epoch's last
/// batch.
#[derive(Debug, Default)]
pub struct LocalEngine;

impl LocalEngine {
    /// Create a local engine
    pub fn new() -> Self {
        Self
    }
}

impl TrainingEngine for LocalEngine {
    fn fit(
        &mut self,
        model: &CaptionModel,
        loader: &mut PrefixLoader,
        callbacks: &[&dyn EngineCallback],
        settings: &RunSettings,
    ) -> Result<FitReport> {
        info!(
            "Starting run: {} epochs, {} total steps, {:?} precision, devices {:?}",
            settings.max_epochs, settings.total_steps, settings.precision, settings.devices
        );
        if let Some(strategy) = &settings.strategy {
            info!("Distributed strategy requested but not handled locally: {strategy}");
        }

        let mut global_step = 0usize;
        let mut final_loss = None;

        for epoch in 0..settings.max_epochs {
            loader.reset();
            let mut epoch_loss = 0.0f32;
            let mut epoch_batches = 0usize;

            while let Some(batch) = loader.next_batch()? {
                let loss = model.forward_batch(&batch)?.to_scalar::<f32>()?;
                global_step += 1;
                epoch_loss += loss;
                epoch_batches += 1;
                final_loss = Some(loss);

                debug!(
                    "epoch {epoch} step {global_step}: loss {loss:.4}, lr scale {:.3}",
                    settings.warmup_factor(global_step)
                );
                for callback in callbacks {
                    callback.on_step_end(epoch, global_step, model)?;
                }
            }

            if epoch_batches > 0 {
                info!(
                    "Epoch {epoch} complete: mean loss {:.4} over {epoch_batches} batches",
                    epoch_loss / epoch_batches as f32
                );
            }
            for callback in callbacks {
                callback.on_epoch_end(epoch, global_step, model)?;
            }
        }

        Ok(FitReport {
            epochs_completed: settings.max_epochs,
            global_steps: global_step,
            final_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use crate::data::{Dataset, DatasetMetadata, PrefixLoaderConfig, PrefixSample};
    use crate::error::Error;
    use crate::lm::Gpt2Backend;
    use crate::model::{CaptionModel, CaptionModelConfig, MappingType, ModelFactory, ModelKind};

    struct TinyDataset {
        metadata: DatasetMetadata,
    }

    impl TinyDataset {
        fn new(num_samples: usize) -> Self {
            Self {
                metadata: DatasetMetadata {
                    name: "tiny".to_string(),
                    num_samples,
                    prefix_size: 6,
                },
            }
        }
    }

    impl Dataset for TinyDataset {
        fn len(&self) -> usize {
            self.metadata.num_samples
        }

        fn get(&self, index: usize) -> Result<PrefixSample> {
            let device = Device::Cpu;
            Ok(PrefixSample {
                id: format!("tiny:{index}"),
                prefix: Tensor::zeros((3, 6), DType::F32, &device)?,
                tokens: Tensor::new(&[1u32, 2, 3, 4], &device)?,
                mask: Tensor::ones(4, DType::F32, &device)?,
            })
        }

        fn metadata(&self) -> &DatasetMetadata {
            &self.metadata
        }
    }

    fn tiny_model() -> CaptionModel {
        let device = Device::Cpu;
        let backend_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&backend_vars, DType::F32, &device);
        let backend = Gpt2Backend::with_dims("gpt2", 8, 16, vb).unwrap();

        let config = CaptionModelConfig {
            kind: ModelKind::PrefixOnly,
            model_type: "gpt2".to_string(),
            variant: "gpt2".to_string(),
            mapping_type: MappingType::Mlp,
            clip_prefix_length: 3,
            prefix_size: 6,
            prefix_length: 5,
            num_layers: 2,
            num_attention_heads: 2,
        };
        ModelFactory::with_backend(&config, 8, Box::new(backend), backend_vars, &device).unwrap()
    }

    fn settings(max_epochs: usize, total_steps: usize) -> RunSettings {
        RunSettings {
            max_epochs,
            devices: DeviceSelection::Devices(vec![0]),
            precision: Precision::Full,
            strategy: None,
            total_steps,
            warmup_steps: 2,
        }
    }

    /// Records the ordered event stream the engine emits
    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<String>>,
    }

    impl EngineCallback for EventLog {
        fn on_epoch_end(
            &self,
            epoch: usize,
            global_step: usize,
            _state: &dyn Checkpointable,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("epoch:{epoch}/{global_step}"));
            Ok(())
        }

        fn on_step_end(
            &self,
            epoch: usize,
            global_step: usize,
            _state: &dyn Checkpointable,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("step:{epoch}/{global_step}"));
            Ok(())
        }
    }

    struct FailingCallback;

    impl EngineCallback for FailingCallback {
        fn on_epoch_end(
            &self,
            _epoch: usize,
            _global_step: usize,
            _state: &dyn Checkpointable,
        ) -> Result<()> {
            Err(Error::persistence("disk full"))
        }

        fn on_step_end(
            &self,
            _epoch: usize,
            _global_step: usize,
            _state: &dyn Checkpointable,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_event_ordering_and_counts() {
        let model = tiny_model();
        let mut loader = PrefixLoader::new(
            Box::new(TinyDataset::new(4)),
            PrefixLoaderConfig {
                batch_size: 2,
                drop_last: false,
            },
        );
        let log = EventLog::default();

        let report = LocalEngine::new()
            .fit(&model, &mut loader, &[&log], &settings(2, 4))
            .unwrap();

        assert_eq!(report.epochs_completed, 2);
        assert_eq!(report.global_steps, 4);
        assert!(report.final_loss.unwrap().is_finite());
        // Both counters reach every event with their true values.
        assert_eq!(
            *log.events.lock().unwrap(),
            vec![
                "step:0/1",
                "step:0/2",
                "epoch:0/2",
                "step:1/3",
                "step:1/4",
                "epoch:1/4"
            ]
        );
    }

    #[test]
    fn test_callback_failure_aborts_run() {
        let model = tiny_model();
        let mut loader = PrefixLoader::new(
            Box::new(TinyDataset::new(2)),
            PrefixLoaderConfig {
                batch_size: 2,
                drop_last: false,
            },
        );

        let result = LocalEngine::new().fit(
            &model,
            &mut loader,
            &[&FailingCallback],
            &settings(3, 3),
        );
        assert!(matches!(result, Err(Error::Persistence(_))));
    }

    #[test]
    fn test_warmup_factor_ramps_linearly() {
        let settings = RunSettings {
            warmup_steps: 4,
            ..settings(1, 10)
        };
        assert_eq!(settings.warmup_factor(0), 0.0);
        assert_eq!(settings.warmup_factor(2), 0.5);
        assert_eq!(settings.warmup_factor(4), 1.0);
        assert_eq!(settings.warmup_factor(100), 1.0);
    }
}
