//! Multi-head scaled dot-product self-attention.
//!
//! Query, key and value are full-width projections split into `num_heads`
//! heads of `head_dim = embedding_dim / num_heads`. Scores are
//! `Q K^T / sqrt(head_dim)` with a softmax over the key axis.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use crate::error::{VitError, VitResult};
use crate::linear::CastLinear;

/// Self-attention over a `(batch, seq_len, embedding_dim)` sequence.
#[derive(Debug, Clone)]
pub struct MultiHeadSelfAttention {
    query: CastLinear,
    key: CastLinear,
    value: CastLinear,
    out: CastLinear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadSelfAttention {
    /// Create the four projections under `vb`.
    ///
    /// # Errors
    ///
    /// Fails with [`VitError::InvalidConfig`] when `num_heads` does not divide
    /// `embedding_dim`.
    pub fn new(embedding_dim: usize, num_heads: usize, vb: VarBuilder) -> VitResult<Self> {
        if num_heads == 0 || embedding_dim % num_heads != 0 {
            return Err(VitError::invalid_config(format!(
                "embedding_dim ({embedding_dim}) must be divisible by num_heads ({num_heads})"
            )));
        }

        let query = CastLinear::new(embedding_dim, embedding_dim, vb.pp("query"))?;
        let key = CastLinear::new(embedding_dim, embedding_dim, vb.pp("key"))?;
        let value = CastLinear::new(embedding_dim, embedding_dim, vb.pp("value"))?;
        let out = CastLinear::new(embedding_dim, embedding_dim, vb.pp("out"))?;

        Ok(Self {
            query,
            key,
            value,
            out,
            num_heads,
            head_dim: embedding_dim / num_heads,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// (batch, seq, embed) -> (batch, heads, seq, head_dim)
    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Project and compute `(q, k, v)` in F32 plus the attention weights.
    fn scores(&self, x: &Tensor, compute: DType) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self.split_heads(&self.query.forward_as(x, compute)?, batch, seq_len)?;
        let k = self.split_heads(&self.key.forward_as(x, compute)?, batch, seq_len)?;
        let v = self.split_heads(&self.value.forward_as(x, compute)?, batch, seq_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?;
        Ok((weights, v))
    }

    /// Attention weights of shape `(batch, heads, seq_len, seq_len)`.
    ///
    /// Each row sums to one over the key axis.
    pub fn attention_weights(&self, x: &Tensor) -> Result<Tensor> {
        let (weights, _) = self.scores(x, x.dtype())?;
        Ok(weights)
    }

    /// Forward pass with projections run in `compute`.
    /// Input: (batch, seq_len, embedding_dim)
    /// Output: (batch, seq_len, embedding_dim)
    pub fn forward_as(&self, x: &Tensor, compute: DType) -> Result<Tensor> {
        let (batch, seq_len, embedding_dim) = x.dims3()?;
        let (weights, v) = self.scores(x, compute)?;

        let attended = weights.to_dtype(v.dtype())?.matmul(&v)?;
        let merged = attended
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, embedding_dim))?;
        self.out.forward_as(&merged, compute)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_as(x, x.dtype())
    }
}
