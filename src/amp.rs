//! Mixed-precision support: autocast dtype selection and dynamic loss scaling.
//!
//! [`GradScaler`] owns the loss-scale state across steps. Each step scales
//! the loss, backpropagates, unscales the gradients and only lets the
//! optimizer apply them when every gradient is finite. [`GradScaler::update`]
//! then adjusts the scale:
//!
//! - an overflowing step multiplies the scale by `backoff_factor` and resets
//!   the run of finite steps
//! - `growth_interval` consecutive finite steps multiply the scale by
//!   `growth_factor`

use candle_core::{DType, Device, Tensor, Var};
use tracing::{debug, warn};

use crate::config::MixedPrecisionConfig;
use crate::error::VitResult;
use crate::optimizer::AdamWOptimizer;

/// Compute dtype for matmuls and convolutions inside the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Autocast {
    dtype: DType,
}

impl Default for Autocast {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Autocast {
    /// Full precision everywhere.
    pub fn disabled() -> Self {
        Self { dtype: DType::F32 }
    }

    /// Autocast to `dtype` unconditionally.
    pub fn with_dtype(dtype: DType) -> Self {
        Self { dtype }
    }

    /// Pick the autocast dtype for `device`.
    ///
    /// Reduced precision is only used on CUDA; on CPU the run falls back to
    /// F32 with a warning.
    pub fn for_device(config: &MixedPrecisionConfig, device: &Device) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        if device.is_cuda() {
            Self::with_dtype(config.dtype.dtype())
        } else {
            warn!("Mixed precision requested on CPU, running the forward pass in F32");
            Self::disabled()
        }
    }

    pub fn compute_dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_enabled(&self) -> bool {
        self.dtype != DType::F32
    }
}

/// Outcome of one scaled optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledStep {
    /// A gradient was inf/NaN and the optimizer step was skipped
    pub found_inf: bool,
    /// L2 norm of the unscaled gradients
    pub grad_norm: f64,
}

/// Dynamic loss scaler.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(config: &MixedPrecisionConfig) -> Self {
        Self {
            scale: config.init_scale,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            growth_tracker: 0,
        }
    }

    /// Current loss scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Consecutive finite steps since the last scale change.
    pub fn growth_tracker(&self) -> usize {
        self.growth_tracker
    }

    /// Scale `loss`, backpropagate, unscale, and step `optimizer` if finite.
    pub fn scale_loss_and_step(
        &self,
        loss: &Tensor,
        vars: &[Var],
        optimizer: &mut AdamWOptimizer,
    ) -> VitResult<ScaledStep> {
        let scaled = loss.affine(self.scale, 0.0)?;
        let mut grads = scaled.backward()?;

        let mut sum_sq = 0f64;
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                let grad = (grad.to_dtype(DType::F32)? / self.scale)?;
                // Squares of large finite F32 values overflow in F32
                sum_sq += grad
                    .to_dtype(DType::F64)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar::<f64>()?;
                grads.insert(var, grad);
            }
        }

        let found_inf = !sum_sq.is_finite();
        if found_inf {
            debug!(scale = self.scale, "non-finite gradients, skipping optimizer step");
        } else {
            optimizer.step(&grads)?;
        }

        Ok(ScaledStep {
            found_inf,
            grad_norm: sum_sq.sqrt(),
        })
    }

    /// Update the scale after a step.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerConfig;
    use crate::augment::cutmix;
    use crate::config::VitConfig;
    use crate::model::VisionTransformer;
    use candle_nn::{Init, VarBuilder, VarMap};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config(growth_interval: usize) -> MixedPrecisionConfig {
        MixedPrecisionConfig {
            growth_interval,
            ..MixedPrecisionConfig::default()
        }
    }

    #[test]
    fn test_initial_scale() {
        let scaler = GradScaler::new(&MixedPrecisionConfig::default());
        assert_eq!(scaler.scale(), 65536.0);
        assert_eq!(scaler.growth_tracker(), 0);
    }

    #[test]
    fn test_backoff_on_overflow() {
        let mut scaler = GradScaler::new(&config(3));
        scaler.update(false);
        scaler.update(false);
        scaler.update(true);
        assert_eq!(scaler.scale(), 32768.0);
        assert_eq!(scaler.growth_tracker(), 0);
    }

    #[test]
    fn test_growth_after_interval() {
        let mut scaler = GradScaler::new(&config(3));
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 65536.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 131072.0);
        assert_eq!(scaler.growth_tracker(), 0);
    }

    #[test]
    fn test_cpu_autocast_falls_back() {
        let autocast = Autocast::for_device(&MixedPrecisionConfig::default(), &Device::Cpu);
        assert!(!autocast.is_enabled());
        assert_eq!(autocast.compute_dtype(), DType::F32);
    }

    #[test]
    fn test_scaled_step_unscales_gradients() -> VitResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(3, "w", Init::Const(2.0))?;

        let mut optimizer = OptimizerConfig::default().build_adamw(&varmap)?;
        let scaler = GradScaler::new(&MixedPrecisionConfig::default());

        // d/dw sum(w^2) = 2w = 4 per element, norm = sqrt(3 * 16)
        let loss = w.sqr()?.sum_all()?;
        let step = scaler.scale_loss_and_step(&loss, &varmap.all_vars(), &mut optimizer)?;
        assert!(!step.found_inf);
        assert!((step.grad_norm - 48f64.sqrt()).abs() < 1e-3);
        assert!(w.to_vec1::<f32>()?.iter().all(|&v| v < 2.0));
        Ok(())
    }

    #[test]
    fn test_overflow_skips_step() -> VitResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // 2w times the scale exceeds the F32 range
        let w = vb.get_with_hints(2, "w", Init::Const(1.0e34))?;

        let mut optimizer = OptimizerConfig::default().build_adamw(&varmap)?;
        let mut scaler = GradScaler::new(&MixedPrecisionConfig::default());

        let loss = w.sqr()?.sum_all()?;
        let step = scaler.scale_loss_and_step(&loss, &varmap.all_vars(), &mut optimizer)?;
        assert!(step.found_inf);
        assert_eq!(w.to_vec1::<f32>()?, vec![1.0e34, 1.0e34]);

        scaler.update(step.found_inf);
        assert_eq!(scaler.scale(), 32768.0);
        Ok(())
    }

    #[test]
    fn test_large_finite_gradients_are_not_overflow() -> VitResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(2, "w", Init::Const(1.0e20))?;

        let mut optimizer = OptimizerConfig::default().build_adamw(&varmap)?;
        let scaler = GradScaler::new(&MixedPrecisionConfig {
            init_scale: 1.0,
            ..MixedPrecisionConfig::default()
        });

        // Each gradient is 2e20, finite in F32 but its square is not
        let loss = w.sqr()?.sum_all()?;
        let step = scaler.scale_loss_and_step(&loss, &varmap.all_vars(), &mut optimizer)?;
        assert!(!step.found_inf);
        let expected = (2.0 * 4.0e40f64).sqrt();
        assert!((step.grad_norm - expected).abs() / expected < 1e-4);
        Ok(())
    }

    #[test]
    fn test_half_precision_step() -> VitResult<()> {
        let device = Device::Cpu;
        let config = VitConfig {
            embedding_dim: 16,
            num_heads: 2,
            num_layers: 1,
            mlp_dim: 32,
            ..VitConfig::test()
        };
        let model = VisionTransformer::new(&config, &device)?;
        let mut optimizer = OptimizerConfig::default().build_adamw(model.var_map())?;
        let scaler = GradScaler::new(&MixedPrecisionConfig::default());
        let autocast = Autocast::with_dtype(DType::F16);
        assert!(autocast.is_enabled());

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let images = Tensor::randn(0f32, 1.0, (2, 3, 224, 224), &device)?;
        let targets = Tensor::new(&[1u32, 7], &device)?;
        let batch = cutmix(&images, &targets, 0.4, &mut rng)?;

        let head = model
            .var_map()
            .data()
            .lock()
            .map_err(|_| crate::error::VitError::training("lock poisoned"))?
            .get("head.linear.weight")
            .cloned()
            .ok_or_else(|| crate::error::VitError::training("missing head weight"))?;
        let before = head.to_vec2::<f32>()?;

        let logits = model.forward_autocast(&batch.images, &autocast)?;
        assert_eq!(logits.dtype(), DType::F32);
        assert_eq!(logits.dims(), &[2, 10]);

        let loss = batch.loss(&logits)?;
        let step = scaler.scale_loss_and_step(&loss, &model.var_map().all_vars(), &mut optimizer)?;
        assert!(!step.found_inf);
        assert!(step.grad_norm.is_finite() && step.grad_norm > 0.0);

        let after = head.to_vec2::<f32>()?;
        assert_ne!(before, after);
        Ok(())
    }
}
