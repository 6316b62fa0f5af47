//! Interchangeable pretrained language-model backends
//!
//! One shared contract, one concrete implementation per family (GPT-2, GPT-J,
//! T0), selected through a variant registry. The contract is the quartet the
//! caption model needs: embedding dimensionality, token-embedding lookup, and
//! a uniform forward over already-embedded inputs, so prepending a visual
//! prefix never branches on backend identity. The transformer stack between
//! the embedding table and the head is the runtime's business and stays
//! opaque here.

use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;

use crate::error::{Error, Result};

mod gpt2;
mod gptj;
mod t0;

pub use gpt2::Gpt2Backend;
pub use gptj::GptJBackend;
pub use t0::T0Backend;

/// Label value marking positions excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Output of a backend forward pass
#[derive(Debug)]
pub struct LmOutput {
    /// Language-modeling loss, present when labels were supplied
    pub loss: Option<Tensor>,
    /// Next-token logits, shape `[batch, seq, vocab]`
    pub logits: Tensor,
}

/// Uniform interface over interchangeable pretrained language models
pub trait LanguageModelBackend: Send + Sync {
    /// Variant identifier this backend was created from
    fn variant(&self) -> &str;

    /// Embedding dimensionality of the token-embedding table
    fn embedding_size(&self) -> usize;

    /// Vocabulary size
    fn vocab_size(&self) -> usize;

    /// Pure lookup into the token-embedding table; no side effects
    fn embed(&self, tokens: &Tensor) -> Result<Tensor>;

    /// Forward over already-embedded inputs.
    ///
    /// `labels`, when present, has shape `[batch, seq]` (i64) with
    /// [`IGNORE_INDEX`] marking positions excluded from the loss;
    /// `attention_mask`, when present, has shape `[batch, seq]` with zeros
    /// on padding positions.
    fn forward(
        &self,
        inputs_embeds: &Tensor,
        labels: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> Result<LmOutput>;
}

/// Create a backend for the given family and variant identifiers.
///
/// Fails with an unsupported-variant error for unrecognized identifiers,
/// before any parameter allocation happens.
pub fn create_backend(
    model_type: &str,
    variant: &str,
    vb: VarBuilder,
) -> Result<Box<dyn LanguageModelBackend>> {
    match model_type {
        "gpt2" => Ok(Box::new(Gpt2Backend::new(variant, vb)?)),
        "gptj" => Ok(Box::new(GptJBackend::new(variant, vb)?)),
        "t0" => Ok(Box::new(T0Backend::new(variant, vb)?)),
        other => Err(Error::unsupported_variant(format!(
            "unknown language model type '{other}' (expected gpt2, gptj, or t0)"
        ))),
    }
}

/// Embedding dimensionality a (family, variant) pair would resolve to
pub fn variant_embedding_size(model_type: &str, variant: &str) -> Result<usize> {
    match model_type {
        "gpt2" => gpt2::hidden_size(variant),
        "gptj" => gptj::hidden_size(variant),
        "t0" => t0::hidden_size(variant),
        other => Err(Error::unsupported_variant(format!(
            "unknown language model type '{other}' (expected gpt2, gptj, or t0)"
        ))),
    }
}

/// Next-token cross-entropy over labeled positions.
///
/// Logits at position `s` predict the label at `s + 1`, matching the
/// shift-inside-the-model convention of the pretrained heads. Positions
/// labeled [`IGNORE_INDEX`] or masked out by `attention_mask` do not
/// contribute.
pub(crate) fn shifted_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    attention_mask: Option<&Tensor>,
) -> Result<Tensor> {
    let (_batch, seq, _vocab) = logits.dims3()?;
    if seq < 2 {
        return Err(Error::dataset(
            "sequence too short for next-token loss".to_string(),
        ));
    }

    let shift_logits = logits.narrow(1, 0, seq - 1)?;
    let shift_labels = labels.narrow(1, 1, seq - 1)?;

    let mut mask = shift_labels
        .ge(0i64)?
        .to_dtype(DType::F32)?;
    if let Some(attention_mask) = attention_mask {
        let shift_attention = attention_mask
            .narrow(1, 1, seq - 1)?
            .to_dtype(DType::F32)?;
        mask = mask.mul(&shift_attention)?;
    }

    // Ignored positions are clamped to token 0 for the gather, then zeroed
    // out by the mask.
    let safe_labels = shift_labels
        .mul(&mask.to_dtype(DType::I64)?)?
        .to_dtype(DType::U32)?;

    let log_probs = candle_nn::ops::log_softmax(&shift_logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let labeled = mask.sum_all()?.to_scalar::<f32>()?;
    if labeled == 0.0 {
        return Err(Error::dataset("no labeled positions in batch".to_string()));
    }

    let nll = picked.mul(&mask)?.sum_all()?.neg()?;
    Ok((nll / labeled as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use test_case::test_case;

    #[test_case("gpt2", "gpt2", 768)]
    #[test_case("gpt2", "gpt2-medium", 1024)]
    #[test_case("gpt2", "gpt2-large", 1280)]
    #[test_case("gpt2", "gpt2-xl", 1600)]
    #[test_case("gptj", "EleutherAI/gpt-j-6B", 4096)]
    #[test_case("t0", "bigscience/T0_3B", 2048)]
    #[test_case("t0", "bigscience/T0pp", 4096)]
    fn test_variant_registry_dimensions(model_type: &str, variant: &str, expected: usize) {
        assert_eq!(
            variant_embedding_size(model_type, variant).unwrap(),
            expected
        );
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let err = variant_embedding_size("bert", "bert-base").unwrap_err();
        assert!(matches!(err, Error::UnsupportedVariant(_)));
    }

    #[test]
    fn test_unknown_variant_is_unsupported() {
        let err = variant_embedding_size("gpt2", "gpt5").unwrap_err();
        assert!(matches!(err, Error::UnsupportedVariant(_)));

        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            create_backend("gpt2", "gpt5", vb),
            Err(Error::UnsupportedVariant(_))
        ));
    }

    #[test]
    fn test_shifted_cross_entropy_ignores_marked_positions() {
        let device = Device::Cpu;
        // Uniform logits over 4 tokens: every labeled position contributes
        // exactly ln(4).
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[IGNORE_INDEX, 2i64, 3]], &device).unwrap();

        let loss = shifted_cross_entropy(&logits, &labels, None)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        approx::assert_abs_diff_eq!(loss, 4.0f32.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_shifted_cross_entropy_requires_labeled_positions() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[IGNORE_INDEX, IGNORE_INDEX]], &device).unwrap();

        assert!(shifted_cross_entropy(&logits, &labels, None).is_err());
    }
}
