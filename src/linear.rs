//! Projection layers that run their matmuls in a chosen compute dtype.
//!
//! Parameters are always stored in F32. Under autocast the weights and the
//! incoming activations are cast to the reduced dtype for the matmul or
//! convolution, and the result is cast back to the caller's dtype so the
//! residual stream and normalisation stay in full precision.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Conv2dConfig, Module, VarBuilder};

use crate::config::PATCH_SIZE;

fn cast(t: &Tensor, dtype: DType) -> Result<Tensor> {
    if t.dtype() == dtype {
        Ok(t.clone())
    } else {
        t.to_dtype(dtype)
    }
}

/// Fully connected layer with bias and autocast support.
#[derive(Debug, Clone)]
pub struct CastLinear {
    inner: candle_nn::Linear,
}

impl CastLinear {
    /// Create a linear layer registered under `vb` as `weight` and `bias`.
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let inner = candle_nn::linear(in_features, out_features, vb)?;
        Ok(Self { inner })
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.inner.weight().dim(1).unwrap_or(0)
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.inner.weight().dim(0).unwrap_or(0)
    }

    /// Apply the layer with the matmul performed in `compute`.
    pub fn forward_as(&self, x: &Tensor, compute: DType) -> Result<Tensor> {
        let out_dtype = x.dtype();
        if compute == out_dtype && self.inner.weight().dtype() == compute {
            return self.inner.forward(x);
        }

        let x = cast(x, compute)?;
        let weight = cast(self.inner.weight(), compute)?;
        let weight = match *x.dims() {
            [b1, b2, _, _] => weight.broadcast_left((b1, b2))?.t()?,
            [bsize, _, _] => weight.broadcast_left(bsize)?.t()?,
            _ => weight.t()?,
        };
        let y = x.matmul(&weight)?;
        let y = match self.inner.bias() {
            Some(bias) => y.broadcast_add(&cast(bias, compute)?)?,
            None => y,
        };
        cast(&y, out_dtype)
    }
}

impl Module for CastLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_as(x, x.dtype())
    }
}

/// Strided convolution that turns an image into a sequence of patch vectors.
///
/// Input `(batch, channels, H, W)`, output `(batch, (H/16)*(W/16), embedding_dim)`.
#[derive(Debug, Clone)]
pub struct PatchEmbedding {
    conv: candle_nn::Conv2d,
    in_channels: usize,
    embedding_dim: usize,
}

impl PatchEmbedding {
    pub fn new(in_channels: usize, embedding_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: PATCH_SIZE,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(in_channels, embedding_dim, PATCH_SIZE, cfg, vb)?;
        Ok(Self {
            conv,
            in_channels,
            embedding_dim,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Patchify with the convolution performed in `compute`.
    pub fn forward_as(&self, images: &Tensor, compute: DType) -> Result<Tensor> {
        let (_, channels, _, _) = images.dims4()?;
        if channels != self.in_channels {
            candle_core::bail!(
                "patch embedding expects {} input channels, got {channels}",
                self.in_channels
            );
        }

        let out_dtype = images.dtype();
        let x = cast(images, compute)?;
        let weight = cast(self.conv.weight(), compute)?;
        let x = x.conv2d(&weight, 0, PATCH_SIZE, 1, 1)?;
        let x = match self.conv.bias() {
            Some(bias) => {
                let bias = cast(bias, compute)?.reshape((1, self.embedding_dim, 1, 1))?;
                x.broadcast_add(&bias)?
            }
            None => x,
        };

        // (B, D, h, w) -> (B, h*w, D)
        let x = x.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        cast(&x, out_dtype)
    }
}

impl Module for PatchEmbedding {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        self.forward_as(images, images.dtype())
    }
}
