//! Caption model: mapping network plus pretrained language-model backend
//!
//! The model prepends a mapped visual prefix to the caption's token
//! embeddings and drives the backend over the combined sequence. Prefix
//! positions carry ignore labels so only caption tokens contribute to the
//! loss. Two training modes exist: full (mapping network and backend both
//! trainable) and prefix-only (backend frozen).

use std::collections::HashMap;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use chrono::Utc;
use tracing::info;

use crate::checkpoint::{Checkpointable, TrainingSnapshot};
use crate::data::PrefixSample;
use crate::error::{Error, Result};
use crate::lm::{self, LanguageModelBackend, IGNORE_INDEX};

pub mod mapping;

pub use mapping::{MappingConfig, MappingNetwork, MappingType};

/// Which parameter groups train
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Mapping network and language model both train
    Full,
    /// Only the mapping network trains, the language model stays frozen
    PrefixOnly,
}

/// Configuration for assembling a caption model
#[derive(Debug, Clone)]
pub struct CaptionModelConfig {
    /// Training mode
    pub kind: ModelKind,
    /// Language-model family identifier
    pub model_type: String,
    /// Language-model variant identifier
    pub variant: String,
    /// Mapping strategy
    pub mapping_type: MappingType,
    /// Number of CLIP feature positions per sample
    pub clip_prefix_length: usize,
    /// Dimensionality of the visual-prefix embedding
    pub prefix_size: usize,
    /// Number of mapped positions handed to the language model
    pub prefix_length: usize,
    /// Mapping-network depth
    pub num_layers: usize,
    /// Mapping-network attention heads
    pub num_attention_heads: usize,
}

/// Image-captioning model over a visual prefix and a caption token sequence
pub struct CaptionModel {
    kind: ModelKind,
    mapping: MappingNetwork,
    backend: Box<dyn LanguageModelBackend>,
    mapping_vars: VarMap,
    backend_vars: VarMap,
}

/// Assembles caption models: kind and backend chosen exactly once, mapping
/// hyperparameters passed through uninterpreted
pub struct ModelFactory;

impl ModelFactory {
    /// Assemble a model from its configuration, allocating fresh parameters
    /// on the given device.
    ///
    /// The mapping network's output dimensionality is taken from the variant
    /// registry, so an unknown variant fails before any allocation.
    pub fn build(config: &CaptionModelConfig, device: &Device) -> Result<CaptionModel> {
        let embedding_size = lm::variant_embedding_size(&config.model_type, &config.variant)?;

        let backend_vars = VarMap::new();
        let backend_vb = VarBuilder::from_varmap(&backend_vars, DType::F32, device);
        let backend = lm::create_backend(&config.model_type, &config.variant, backend_vb)?;

        Self::with_backend(config, embedding_size, backend, backend_vars, device)
    }

    /// Assemble a model around an already-built backend.
    ///
    /// `backend_vars` must be the variable map the backend's parameters were
    /// registered in, or prefix-only freezing and snapshots will miss them.
    pub fn with_backend(
        config: &CaptionModelConfig,
        embedding_size: usize,
        backend: Box<dyn LanguageModelBackend>,
        backend_vars: VarMap,
        device: &Device,
    ) -> Result<CaptionModel> {
        let mapping_vars = VarMap::new();
        let mapping_vb = VarBuilder::from_varmap(&mapping_vars, DType::F32, device);
        let mapping = MappingNetwork::new(
            MappingConfig {
                mapping_type: config.mapping_type,
                clip_prefix_length: config.clip_prefix_length,
                prefix_size: config.prefix_size,
                prefix_length: config.prefix_length,
                embedding_size,
                num_layers: config.num_layers,
                num_attention_heads: config.num_attention_heads,
            },
            mapping_vb,
        )?;

        match config.kind {
            ModelKind::Full => {
                info!("Training both the mapping network and the language model")
            }
            ModelKind::PrefixOnly => {
                info!("Training only the mapping network, language model is frozen")
            }
        }

        Ok(CaptionModel {
            kind: config.kind,
            mapping,
            backend,
            mapping_vars,
            backend_vars,
        })
    }
}

impl CaptionModel {
    /// Training mode this model was assembled with
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Variant identifier of the underlying backend
    pub fn variant(&self) -> &str {
        self.backend.variant()
    }

    /// Number of mapped prefix positions prepended to each caption
    pub fn prefix_length(&self) -> usize {
        self.mapping.config().prefix_length
    }

    /// Loss over a batch: mapped prefix prepended to token embeddings, with
    /// prefix positions excluded from the loss.
    ///
    /// `prefix` has shape `[batch, clip_prefix_length, prefix_size]`,
    /// `tokens` has shape `[batch, seq_len]`. `token_mask`, when present,
    /// covers the token positions; prefix positions are always attended.
    pub fn forward(
        &self,
        prefix: &Tensor,
        tokens: &Tensor,
        token_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, _seq) = tokens.dims2()?;

        let prefix_embeds = self.mapping.forward(prefix)?;
        let token_embeds = self.backend.embed(tokens)?;
        let inputs_embeds = Tensor::cat(&[&prefix_embeds, &token_embeds], 1)?;

        let ignore = Tensor::full(
            IGNORE_INDEX,
            (batch, self.prefix_length()),
            tokens.device(),
        )?;
        let labels = Tensor::cat(&[&ignore, &tokens.to_dtype(DType::I64)?], 1)?;

        let attention_mask = token_mask
            .map(|mask| {
                let prefix_ones = Tensor::ones(
                    (batch, self.prefix_length()),
                    mask.dtype(),
                    mask.device(),
                )?;
                Tensor::cat(&[&prefix_ones, mask], 1)
            })
            .transpose()?;

        let output = self
            .backend
            .forward(&inputs_embeds, Some(&labels), attention_mask.as_ref())?;
        output
            .loss
            .ok_or_else(|| Error::dataset("backend produced no loss for labeled batch"))
    }

    /// Loss over a loader batch, stacking per-sample tensors first.
    ///
    /// All samples in the batch must share prefix and token shapes.
    pub fn forward_batch(&self, samples: &[PrefixSample]) -> Result<Tensor> {
        if samples.is_empty() {
            return Err(Error::dataset("cannot run a forward pass on an empty batch"));
        }

        let prefixes: Vec<&Tensor> = samples.iter().map(|s| &s.prefix).collect();
        let tokens: Vec<&Tensor> = samples.iter().map(|s| &s.tokens).collect();
        let masks: Vec<&Tensor> = samples.iter().map(|s| &s.mask).collect();
        let prefix = Tensor::stack(&prefixes, 0)?;
        let tokens = Tensor::stack(&tokens, 0)?;
        let mask = Tensor::stack(&masks, 0)?;

        self.forward(&prefix, &tokens, Some(&mask))
    }

    /// Variables the optimizer should update, per the training mode
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.mapping_vars.all_vars();
        if self.kind == ModelKind::Full {
            vars.extend(self.backend_vars.all_vars());
        }
        vars
    }

    fn named_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (scope, vars) in [
            ("mapping", &self.mapping_vars),
            ("backend", &self.backend_vars),
        ] {
            let data = vars
                .data()
                .lock()
                .map_err(|_| Error::persistence("variable map lock poisoned"))?;
            for (name, var) in data.iter() {
                tensors.insert(format!("{scope}.{name}"), var.as_tensor().clone());
            }
        }
        Ok(tensors)
    }
}

impl Checkpointable for CaptionModel {
    fn recoverable_state(&self, epoch: usize, global_step: usize) -> Result<Vec<u8>> {
        let tensors = self.named_tensors()?;
        let model_state = safetensors::tensor::serialize(&tensors, None)
            .map_err(|e| Error::persistence(format!("failed to serialize parameters: {e}")))?;

        let snapshot = TrainingSnapshot {
            epoch,
            global_step,
            model_state,
            created_at: Utc::now(),
        };
        snapshot.to_bytes()
    }
}

impl CaptionModelConfig {
    /// Derive a model configuration from raw flag values
    pub fn from_flags(
        prefix_only: bool,
        model_type: &str,
        variant: &str,
        mapping_type: &str,
        clip_prefix_length: usize,
        prefix_size: usize,
        prefix_length: usize,
        num_layers: usize,
        num_attention_heads: usize,
    ) -> Result<Self> {
        Ok(Self {
            kind: if prefix_only {
                ModelKind::PrefixOnly
            } else {
                ModelKind::Full
            },
            model_type: model_type.to_string(),
            variant: variant.to_string(),
            mapping_type: MappingType::from_str(mapping_type)?,
            clip_prefix_length,
            prefix_size,
            prefix_length,
            num_layers,
            num_attention_heads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::Gpt2Backend;

    fn tiny_config(kind: ModelKind) -> CaptionModelConfig {
        CaptionModelConfig {
            kind,
            model_type: "gpt2".to_string(),
            variant: "gpt2".to_string(),
            mapping_type: MappingType::Mlp,
            clip_prefix_length: 3,
            prefix_size: 6,
            prefix_length: 5,
            num_layers: 2,
            num_attention_heads: 2,
        }
    }

    fn tiny_model(kind: ModelKind) -> CaptionModel {
        let device = Device::Cpu;
        let backend_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&backend_vars, DType::F32, &device);
        let backend = Gpt2Backend::with_dims("gpt2", 8, 16, vb).unwrap();

        ModelFactory::with_backend(
            &tiny_config(kind),
            8,
            Box::new(backend),
            backend_vars,
            &device,
        )
        .unwrap()
    }

    fn tiny_batch(device: &Device) -> Vec<PrefixSample> {
        (0..2)
            .map(|i| PrefixSample {
                id: format!("sample-{i}"),
                prefix: Tensor::zeros((3, 6), DType::F32, device).unwrap(),
                tokens: Tensor::new(&[1u32, 2, 3, 4], device).unwrap(),
                mask: Tensor::ones(4, DType::F32, device).unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_forward_batch_produces_finite_loss() {
        let model = tiny_model(ModelKind::Full);
        let loss = model
            .forward_batch(&tiny_batch(&Device::Cpu))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss > 0.0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let model = tiny_model(ModelKind::Full);
        assert!(model.forward_batch(&[]).is_err());
    }

    #[test]
    fn test_prefix_only_freezes_backend() {
        let full = tiny_model(ModelKind::Full);
        let frozen = tiny_model(ModelKind::PrefixOnly);

        assert!(full.trainable_vars().len() > frozen.trainable_vars().len());
        assert_eq!(
            frozen.trainable_vars().len(),
            frozen.mapping_vars.all_vars().len()
        );
    }

    #[test]
    fn test_unknown_variant_fails_before_allocation() {
        let config = CaptionModelConfig {
            variant: "gpt5".to_string(),
            ..tiny_config(ModelKind::Full)
        };
        assert!(matches!(
            ModelFactory::build(&config, &Device::Cpu),
            Err(Error::UnsupportedVariant(_))
        ));
    }

    #[test]
    fn test_snapshot_names_both_parameter_groups() {
        let model = tiny_model(ModelKind::PrefixOnly);
        let bytes = model.recoverable_state(2, 40).unwrap();

        let snapshot = TrainingSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snapshot.epoch, 2);
        assert_eq!(snapshot.global_step, 40);

        let tensors = safetensors::SafeTensors::deserialize(&snapshot.model_state).unwrap();
        let names: Vec<&str> = tensors.names().into_iter().collect();
        assert!(names.iter().any(|n| n.starts_with("mapping.")));
        assert!(names.iter().any(|n| n.starts_with("backend.")));
    }
}
