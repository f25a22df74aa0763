//! AdamW over the model's parameter map.

use candle_core::backprop::GradStore;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::TrainingConfig;
use crate::error::{VitError, VitResult};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 1e-4,
            eps: 1e-8,
        }
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(training: &TrainingConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            weight_decay: training.weight_decay,
            ..Self::default()
        }
    }
}

impl OptimizerConfig {
    /// Create AdamW over every variable in `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, varmap: &VarMap) -> VitResult<AdamWOptimizer> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let inner = candle_nn::AdamW::new(varmap.all_vars(), params)
            .map_err(|e| VitError::training(format!("Failed to create AdamW: {e}")))?;

        Ok(AdamWOptimizer { inner })
    }
}

/// AdamW optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamWOptimizer {
    /// Apply one update from already computed (and unscaled) gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> VitResult<()> {
        self.inner
            .step(grads)
            .map_err(|e| VitError::training(format!("Optimizer step failed: {e}")))
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}
