//! T0 family backend

use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use once_cell::sync::Lazy;
use tracing::debug;

use super::{shifted_cross_entropy, LanguageModelBackend, LmOutput};
use crate::error::{Error, Result};

const T0_VOCAB_SIZE: usize = 32_128;

/// Variant identifier to model dimension
static T0_VARIANTS: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    HashMap::from([
        ("bigscience/T0_3B", 2048),
        ("bigscience/T0", 4096),
        ("bigscience/T0pp", 4096),
    ])
});

/// Model dimension for a T0 variant identifier
pub(crate) fn hidden_size(variant: &str) -> Result<usize> {
    T0_VARIANTS.get(variant).copied().ok_or_else(|| {
        Error::unsupported_variant(format!(
            "unknown t0 variant '{variant}' (expected bigscience/T0, \
             bigscience/T0_3B, or bigscience/T0pp)"
        ))
    })
}

/// T0 language-model backend.
///
/// T0 shares one embedding table between encoder and decoder, hence the
/// `shared` parameter path; the head projects without bias.
pub struct T0Backend {
    variant: String,
    hidden_size: usize,
    vocab_size: usize,
    shared: Embedding,
    lm_head: Linear,
}

impl T0Backend {
    /// Create a backend for a T0 variant
    pub fn new(variant: &str, vb: VarBuilder) -> Result<Self> {
        let hidden_size = hidden_size(variant)?;
        Self::with_dims(variant, hidden_size, T0_VOCAB_SIZE, vb)
    }

    /// Create a backend with explicit dimensions
    pub fn with_dims(
        variant: &str,
        hidden_size: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        debug!(
            "Creating t0 backend '{variant}' (hidden={hidden_size}, vocab={vocab_size})"
        );
        let shared = candle_nn::embedding(vocab_size, hidden_size, vb.pp("shared"))?;
        let lm_head = candle_nn::linear_no_bias(hidden_size, vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            variant: variant.to_string(),
            hidden_size,
            vocab_size,
            shared,
            lm_head,
        })
    }
}

impl LanguageModelBackend for T0Backend {
    fn variant(&self) -> &str {
        &self.variant
    }

    fn embedding_size(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        Ok(self.shared.forward(tokens)?)
    }

    fn forward(
        &self,
        inputs_embeds: &Tensor,
        labels: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> Result<LmOutput> {
        let logits = self.lm_head.forward(inputs_embeds)?;

        let loss = labels
            .map(|labels| shifted_cross_entropy(&logits, labels, attention_mask))
            .transpose()?;

        Ok(LmOutput { loss, logits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_unknown_variant_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            T0Backend::new("bigscience/T5", vb),
            Err(Error::UnsupportedVariant(_))
        ));
    }

    #[test]
    fn test_embed_and_forward_shapes() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let backend = T0Backend::with_dims("bigscience/T0_3B", 8, 16, vb).unwrap();

        let tokens = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
        let embeds = backend.embed(&tokens).unwrap();
        assert_eq!(embeds.dims(), &[1, 3, 8]);

        let out = backend.forward(&embeds, None, None).unwrap();
        assert_eq!(out.logits.dims(), &[1, 3, 16]);
    }
}
