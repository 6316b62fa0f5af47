//! GPT-2 family backend

use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use once_cell::sync::Lazy;
use tracing::debug;

use super::{shifted_cross_entropy, LanguageModelBackend, LmOutput};
use crate::error::{Error, Result};

const GPT2_VOCAB_SIZE: usize = 50_257;

/// Variant identifier to hidden size
static GPT2_VARIANTS: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    HashMap::from([
        ("gpt2", 768),
        ("gpt2-medium", 1024),
        ("gpt2-large", 1280),
        ("gpt2-xl", 1600),
    ])
});

/// Hidden size for a GPT-2 variant identifier
pub(crate) fn hidden_size(variant: &str) -> Result<usize> {
    GPT2_VARIANTS.get(variant).copied().ok_or_else(|| {
        Error::unsupported_variant(format!(
            "unknown gpt2 variant '{variant}' (expected one of gpt2, gpt2-medium, \
             gpt2-large, gpt2-xl)"
        ))
    })
}

/// GPT-2 language-model backend
pub struct Gpt2Backend {
    variant: String,
    hidden_size: usize,
    vocab_size: usize,
    wte: Embedding,
    lm_head: Linear,
}

impl Gpt2Backend {
    /// Create a backend for a GPT-2 variant, pulling weights from the
    /// supplied variable builder
    pub fn new(variant: &str, vb: VarBuilder) -> Result<Self> {
        let hidden_size = hidden_size(variant)?;
        Self::with_dims(variant, hidden_size, GPT2_VOCAB_SIZE, vb)
    }

    /// Create a backend with explicit dimensions
    pub fn with_dims(
        variant: &str,
        hidden_size: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        debug!(
            "Creating gpt2 backend '{variant}' (hidden={hidden_size}, vocab={vocab_size})"
        );
        let wte = candle_nn::embedding(vocab_size, hidden_size, vb.pp("transformer.wte"))?;
        let lm_head = candle_nn::linear_no_bias(hidden_size, vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            variant: variant.to_string(),
            hidden_size,
            vocab_size,
            wte,
            lm_head,
        })
    }
}

impl LanguageModelBackend for Gpt2Backend {
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
        Ok(self.wte.forward(tokens)?)
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
