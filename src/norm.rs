//! Layer normalization built from basic tensor ops.
//!
//! Statistics are always computed in F32, whatever dtype the input arrives
//! in, and the result is returned in the input dtype.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

/// LayerNorm over the last dimension with learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Width of the normalized dimension.
    pub fn normalized_shape(&self) -> usize {
        self.weight.dims()[0]
    }

    fn forward_impl(&self, x: &Tensor) -> Result<Tensor> {
        let in_dtype = x.dtype();
        let x = if in_dtype == DType::F32 {
            x.clone()
        } else {
            x.to_dtype(DType::F32)?
        };

        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        let normalized = centered.broadcast_div(&std)?;

        let y = normalized
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        if in_dtype == DType::F32 {
            Ok(y)
        } else {
            y.to_dtype(in_dtype)
        }
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_impl(x)
    }
}

/// Create a layer norm registered as `weight` (ones) and `bias` (zeros).
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}
