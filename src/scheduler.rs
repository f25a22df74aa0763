//! Per-epoch learning rate schedules.

use crate::optimizer::AdamWOptimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Cosine annealing from the base rate down to `eta_min` over `t_max` epochs
    CosineAnnealing {
        /// Epochs in one half cosine period
        t_max: usize,
        /// Floor learning rate
        eta_min: f64,
    },
}

/// Learning rate scheduler, stepped once per epoch.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_epoch: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_epoch: 0,
        }
    }

    /// Number of completed `step` calls.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Get learning rate for the current epoch.
    pub fn get_lr(&self) -> f64 {
        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::CosineAnnealing { t_max, eta_min } => {
                if *t_max == 0 {
                    return self.base_lr;
                }
                let progress = self.current_epoch as f64 / *t_max as f64;
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                eta_min + (self.base_lr - eta_min) * cosine
            }
        }
    }

    /// Advance one epoch and update the optimizer.
    pub fn step(&mut self, optimizer: &mut AdamWOptimizer) {
        self.current_epoch += 1;
        optimizer.set_learning_rate(self.get_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LRScheduler::new(SchedulerType::Constant, 1e-3);
        assert_eq!(scheduler.get_lr(), 1e-3);
    }

    #[test]
    fn test_cosine_annealing() {
        let mut scheduler = LRScheduler::new(
            SchedulerType::CosineAnnealing {
                t_max: 4,
                eta_min: 1e-6,
            },
            1e-4,
        );

        // Epoch 0 uses the base rate
        assert!((scheduler.get_lr() - 1e-4).abs() < 1e-12);

        // Halfway is the midpoint between base and floor
        scheduler.current_epoch = 2;
        let mid = 1e-6 + (1e-4 - 1e-6) * 0.5;
        assert!((scheduler.get_lr() - mid).abs() < 1e-12);

        // End of the period reaches the floor
        scheduler.current_epoch = 4;
        assert!((scheduler.get_lr() - 1e-6).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_is_monotone_over_period() {
        let mut scheduler = LRScheduler::new(
            SchedulerType::CosineAnnealing {
                t_max: 10,
                eta_min: 0.0,
            },
            1.0,
        );
        let mut previous = scheduler.get_lr();
        for epoch in 1..=10 {
            scheduler.current_epoch = epoch;
            let lr = scheduler.get_lr();
            assert!(lr <= previous);
            previous = lr;
        }
    }
}
