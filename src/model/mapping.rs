//! Mapping network: visual-prefix embeddings into language-model space

use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::{Init, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Mapping strategy identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    /// Flatten-and-project MLP
    Mlp,
    /// Learned prefix constant mixed with projected CLIP positions
    Transformer,
}

impl FromStr for MappingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mlp" => Ok(Self::Mlp),
            "transformer" => Ok(Self::Transformer),
            other => Err(Error::config(format!(
                "unknown mapping type '{other}' (expected mlp or transformer)"
            ))),
        }
    }
}

/// Configuration for the mapping network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Mapping strategy
    pub mapping_type: MappingType,
    /// Number of CLIP feature positions per sample
    pub clip_prefix_length: usize,
    /// Dimensionality of the visual-prefix embedding
    pub prefix_size: usize,
    /// Number of mapped positions handed to the language model
    pub prefix_length: usize,
    /// Language-model embedding dimensionality
    pub embedding_size: usize,
    /// Number of layers
    pub num_layers: usize,
    /// Number of attention heads (transformer strategy)
    pub num_attention_heads: usize,
}

/// Trainable network projecting a visual prefix into the language model's
/// embedding space.
pub struct MappingNetwork {
    config: MappingConfig,
    strategy: Strategy,
}

enum Strategy {
    Mlp {
        layers: Vec<Linear>,
    },
    Transformer {
        input_proj: Linear,
        prefix_const: Tensor,
        blocks: Vec<Linear>,
    },
}

impl MappingNetwork {
    /// Build a mapping network from its configuration
    pub fn new(config: MappingConfig, vb: VarBuilder) -> Result<Self> {
        if config.num_layers == 0 {
            return Err(Error::config("mapping network needs at least one layer"));
        }

        let strategy = match config.mapping_type {
            MappingType::Mlp => Self::build_mlp(&config, vb)?,
            MappingType::Transformer => Self::build_transformer(&config, vb)?,
        };

        debug!(
            "Built {:?} mapping network ({} -> {} positions)",
            config.mapping_type, config.clip_prefix_length, config.prefix_length
        );

        Ok(Self { config, strategy })
    }

    fn build_mlp(config: &MappingConfig, vb: VarBuilder) -> Result<Strategy> {
        let input_dim = config.clip_prefix_length * config.prefix_size;
        let output_dim = config.prefix_length * config.embedding_size;
        let hidden_dim = (input_dim + output_dim) / 2;

        let mut layers = Vec::with_capacity(config.num_layers);
        if config.num_layers == 1 {
            layers.push(candle_nn::linear(input_dim, output_dim, vb.pp("mlp.0"))?);
        } else {
            layers.push(candle_nn::linear(input_dim, hidden_dim, vb.pp("mlp.0"))?);
            for i in 1..config.num_layers - 1 {
                layers.push(candle_nn::linear(
                    hidden_dim,
                    hidden_dim,
                    vb.pp(format!("mlp.{i}")),
                )?);
            }
            layers.push(candle_nn::linear(
                hidden_dim,
                output_dim,
                vb.pp(format!("mlp.{}", config.num_layers - 1)),
            )?);
        }

        Ok(Strategy::Mlp { layers })
    }

    fn build_transformer(config: &MappingConfig, vb: VarBuilder) -> Result<Strategy> {
        if config.embedding_size % config.num_attention_heads != 0 {
            return Err(Error::config(format!(
                "embedding size {} is not divisible by {} attention heads",
                config.embedding_size, config.num_attention_heads
            )));
        }

        let input_proj = candle_nn::linear(
            config.prefix_size,
            config.embedding_size,
            vb.pp("input_proj"),
        )?;
        let prefix_const = vb.get_with_hints(
            (config.prefix_length, config.embedding_size),
            "prefix_const",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(candle_nn::linear(
                config.embedding_size,
                config.embedding_size,
                vb.pp(format!("block.{i}")),
            )?);
        }

        Ok(Strategy::Transformer {
            input_proj,
            prefix_const,
            blocks,
        })
    }

    /// Configuration this network was built from
    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    /// Map a batch of visual prefixes, shape `[batch, clip_prefix_length,
    /// prefix_size]`, into `[batch, prefix_length, embedding_size]`
    pub fn forward(&self, prefix: &Tensor) -> Result<Tensor> {
        let (batch, clip_len, prefix_size) = prefix.dims3()?;
        if clip_len != self.config.clip_prefix_length || prefix_size != self.config.prefix_size {
            return Err(Error::dataset(format!(
                "prefix shape [{clip_len}, {prefix_size}] does not match configured \
                 [{}, {}]",
                self.config.clip_prefix_length, self.config.prefix_size
            )));
        }

        match &self.strategy {
            Strategy::Mlp { layers } => {
                let mut x = prefix.reshape((batch, clip_len * prefix_size))?;
                for (i, layer) in layers.iter().enumerate() {
                    x = layer.forward(&x)?;
                    if i < layers.len() - 1 {
                        x = x.tanh()?;
                    }
                }
                Ok(x.reshape((
                    batch,
                    self.config.prefix_length,
                    self.config.embedding_size,
                ))?)
            }
            Strategy::Transformer {
                input_proj,
                prefix_const,
                blocks,
            } => {
                let projected = input_proj.forward(prefix)?;
                let constant = prefix_const
                    .unsqueeze(0)?
                    .expand((batch, self.config.prefix_length, self.config.embedding_size))?;
                let mut x = Tensor::cat(&[&projected, &constant], 1)?;
                for block in blocks {
                    x = block.forward(&x)?.tanh()?;
                }
                // The mapped prefix is what the mixing layers wrote into the
                // learned-constant positions.
                Ok(x.narrow(1, clip_len, self.config.prefix_length)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use test_case::test_case;

    fn test_config(mapping_type: MappingType) -> MappingConfig {
        MappingConfig {
            mapping_type,
            clip_prefix_length: 3,
            prefix_size: 6,
            prefix_length: 5,
            embedding_size: 8,
            num_layers: 2,
            num_attention_heads: 2,
        }
    }

    #[test]
    fn test_mapping_type_parse() {
        assert_eq!(MappingType::from_str("mlp").unwrap(), MappingType::Mlp);
        assert_eq!(
            MappingType::from_str("transformer").unwrap(),
            MappingType::Transformer
        );
        assert!(matches!(
            MappingType::from_str("conv"),
            Err(Error::Config(_))
        ));
    }

    #[test_case(MappingType::Mlp)]
    #[test_case(MappingType::Transformer)]
    fn test_forward_output_shape(mapping_type: MappingType) {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let network = MappingNetwork::new(test_config(mapping_type), vb).unwrap();

        let prefix = Tensor::zeros((2, 3, 6), DType::F32, &Device::Cpu).unwrap();
        let mapped = network.forward(&prefix).unwrap();
        assert_eq!(mapped.dims(), &[2, 5, 8]);
    }

    #[test]
    fn test_mismatched_prefix_shape_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let network = MappingNetwork::new(test_config(MappingType::Mlp), vb).unwrap();

        let prefix = Tensor::zeros((2, 4, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(network.forward(&prefix).is_err());
    }

    #[test]
    fn test_head_divisibility_enforced() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let config = MappingConfig {
            num_attention_heads: 3,
            ..test_config(MappingType::Transformer)
        };
        assert!(matches!(
            MappingNetwork::new(config, vb),
            Err(Error::Config(_))
        ));
    }
}
