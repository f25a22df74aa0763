//! Position-wise feed-forward network: Linear -> GELU -> Linear.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use crate::linear::CastLinear;

/// Two-layer MLP expanding to `mlp_dim` and projecting back.
#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: CastLinear,
    fc2: CastLinear,
}

impl FeedForward {
    pub fn new(embedding_dim: usize, mlp_dim: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = CastLinear::new(embedding_dim, mlp_dim, vb.pp("fc1"))?;
        let fc2 = CastLinear::new(mlp_dim, embedding_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    /// Forward pass
    /// Input: (batch, seq_len, embedding_dim)
    /// Output: (batch, seq_len, embedding_dim)
    pub fn forward_as(&self, x: &Tensor, compute: DType) -> Result<Tensor> {
        // Exact erf GELU, same as the non-approximated reference
        let hidden = self.fc1.forward_as(x, compute)?.gelu_erf()?;
        self.fc2.forward_as(&hidden, compute)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_as(x, x.dtype())
    }
}
