//! GPT-J family backend

use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::{Embedding, Linear, Module, VarBuilder};
use once_cell::sync::Lazy;
use tracing::debug;

use super::{shifted_cross_entropy, LanguageModelBackend, LmOutput};
use crate::error::{Error, Result};

const GPTJ_VOCAB_SIZE: usize = 50_400;

/// Variant identifier to hidden size
static GPTJ_VARIANTS: Lazy<HashMap<&'static str, usize>> =
    Lazy::new(|| HashMap::from([("EleutherAI/gpt-j-6B", 4096)]));

/// Hidden size for a GPT-J variant identifier
pub(crate) fn hidden_size(variant: &str) -> Result<usize> {
    GPTJ_VARIANTS.get(variant).copied().ok_or_else(|| {
        Error::unsupported_variant(format!(
            "unknown gptj variant '{variant}' (expected EleutherAI/gpt-j-6B)"
        ))
    })
}

/// GPT-J language-model backend.
///
/// GPT-J ties no weights between the embedding table and the head, so both
/// are materialized independently; the head carries a bias, unlike GPT-2's.
pub struct GptJBackend {
    variant: String,
    hidden_size: usize,
    vocab_size: usize,
    wte: Embedding,
    lm_head: Linear,
}

impl GptJBackend {
    /// Create a backend for a GPT-J variant
    pub fn new(variant: &str, vb: VarBuilder) -> Result<Self> {
        let hidden_size = hidden_size(variant)?;
        Self::with_dims(variant, hidden_size, GPTJ_VOCAB_SIZE, vb)
    }

    /// Create a backend with explicit dimensions
    pub fn with_dims(
        variant: &str,
        hidden_size: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        debug!(
            "Creating gptj backend '{variant}' (hidden={hidden_size}, vocab={vocab_size})"
        );
        let wte = candle_nn::embedding(vocab_size, hidden_size, vb.pp("transformer.wte"))?;
        let lm_head = candle_nn::linear(hidden_size, vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            variant: variant.to_string(),
            hidden_size,
            vocab_size,
            wte,
            lm_head,
        })
    }
}

impl LanguageModelBackend for GptJBackend {
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
