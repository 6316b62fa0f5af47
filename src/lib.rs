//! clipcap - Training orchestration for CLIP-prefix image captioning
//!
//! This crate drives the training lifecycle of a prefix-captioning model: a
//! frozen-or-trainable pretrained language model consuming a learned mapping
//! of CLIP image embeddings, with checkpointing on epoch and step cadences
//! and a guaranteed final save.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod engine;
pub mod error;
pub mod lm;
pub mod model;
pub mod trainer;

// Re-exports
pub use checkpoint::{CheckpointSaver, Checkpointable, TrainingSnapshot};
pub use config::TrainConfig;
pub use data::{CompositeDataset, Dataset, PrefixDataset, PrefixLoader, PrefixSample};
pub use device::DeviceSelection;
pub use engine::{EngineCallback, FitReport, LocalEngine, Precision, RunSettings, TrainingEngine};
pub use error::{Error, Result};
pub use lm::{create_backend, LanguageModelBackend};
pub use model::{
    CaptionModel, CaptionModelConfig, MappingNetwork, MappingType, ModelFactory, ModelKind,
};
pub use trainer::TrainingOrchestrator;
