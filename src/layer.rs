//! Transformer encoder block.
//!
//! Post-norm placement: each sublayer's residual sum is normalized,
//! `x = norm1(x + attn(x))` then `out = norm2(x + mlp(x))`.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::attention::MultiHeadSelfAttention;
use crate::config::VitConfig;
use crate::error::VitResult;
use crate::mlp::FeedForward;
use crate::norm::{layer_norm, LayerNorm};

/// Single encoder block
#[derive(Debug, Clone)]
pub struct TransformerEncoderBlock {
    attention: MultiHeadSelfAttention,
    norm1: LayerNorm,
    mlp: FeedForward,
    norm2: LayerNorm,
}

impl TransformerEncoderBlock {
    pub fn new(config: &VitConfig, vb: VarBuilder) -> VitResult<Self> {
        let d = config.embedding_dim;
        let eps = config.layer_norm_eps;

        let attention = MultiHeadSelfAttention::new(d, config.num_heads, vb.pp("attention"))?;
        let norm1 = layer_norm(d, eps, vb.pp("norm1"))?;
        let mlp = FeedForward::new(d, config.mlp_dim, vb.pp("mlp"))?;
        let norm2 = layer_norm(d, eps, vb.pp("norm2"))?;

        Ok(Self {
            attention,
            norm1,
            mlp,
            norm2,
        })
    }

    /// Forward pass
    /// Input: (batch, seq_len, embedding_dim)
    /// Output: (batch, seq_len, embedding_dim)
    pub fn forward_as(&self, x: &Tensor, compute: DType) -> Result<Tensor> {
        let attn_out = self.attention.forward_as(x, compute)?;
        let x = self.norm1.forward(&(x + attn_out)?)?;

        let mlp_out = self.mlp.forward_as(&x, compute)?;
        self.norm2.forward(&(x + mlp_out)?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_as(x, x.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};
    use candle_nn::VarMap;

    #[test]
    fn test_block_shape() {
        let config = VitConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = TransformerEncoderBlock::new(&config, vb).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 8, config.embedding_dim), &device).unwrap();
        let out = block.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 8, config.embedding_dim]);
    }

    #[test]
    fn test_block_output_is_normalized() {
        let config = VitConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = TransformerEncoderBlock::new(&config, vb).unwrap();
        let x = Tensor::randn(5.0f32, 3.0, (1, 4, config.embedding_dim), &device).unwrap();
        let out = block.forward(&x).unwrap();

        // Freshly initialized norm2 has unit scale and zero shift
        let means = out.mean(D::Minus1).unwrap().flatten_all().unwrap();
        for m in means.to_vec1::<f32>().unwrap() {
            assert!(m.abs() < 1e-4, "token mean was {m}");
        }
    }
}
