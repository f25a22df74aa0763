//! Training and evaluation loops.
//!
//! The caller owns a [`TrainingSession`] and threads it through every epoch:
//! [`Trainer::train_epoch`] takes the session by value and hands it back with
//! the new history entries appended.

use std::path::Path;

use candle_core::{Device, Var, D};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::amp::{Autocast, GradScaler};
use crate::augment::{count_matches, MixStrategy};
use crate::config::TrainingConfig;
use crate::data::DataLoader;
use crate::error::{VitError, VitResult};
use crate::model::VisionTransformer;
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};
use crate::scheduler::{LRScheduler, SchedulerType};

/// Pick the compute device.
///
/// CUDA is used when the crate is built with the `cuda` feature and a device
/// is present, unless `VIT_FORCE_CPU=1`. `VIT_CUDA_DEVICE` selects the ordinal.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("VIT_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("VIT_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU.");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::warn!("CPU mode forced via VIT_FORCE_CPU=1.");
        } else {
            tracing::warn!("CUDA feature disabled; running on CPU. Enable with --features cuda.");
        }
        Device::Cpu
    }
}

/// Average loss and percentage accuracy over one pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    /// Percent, in `[0, 100]`
    pub accuracy: f64,
}

/// Per-epoch history owned by the training driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSession {
    pub train_losses: Vec<f64>,
    pub train_accuracies: Vec<f64>,
    pub test_losses: Vec<f64>,
    pub test_accuracies: Vec<f64>,
    /// Learning rate in effect at the start of each epoch
    pub learning_rates: Vec<f64>,
    /// Lowest test loss seen so far
    pub best_test_loss: Option<f64>,
    pub epochs_completed: usize,
    /// Optimizer steps skipped because of non-finite gradients
    #[serde(default)]
    pub skipped_steps: usize,
}

impl TrainingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append training metrics for one epoch.
    pub fn record_train(&mut self, metrics: EpochMetrics) {
        self.train_losses.push(metrics.loss);
        self.train_accuracies.push(metrics.accuracy);
    }

    /// Append evaluation metrics; returns `true` when the test loss improved.
    pub fn record_test(&mut self, metrics: EpochMetrics) -> bool {
        self.test_losses.push(metrics.loss);
        self.test_accuracies.push(metrics.accuracy);

        let improved = self.best_test_loss.map_or(true, |best| metrics.loss < best);
        if improved {
            self.best_test_loss = Some(metrics.loss);
        }
        improved
    }

    /// Write the history as pretty JSON.
    pub fn save_json(&self, path: &Path) -> VitResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a history written by [`TrainingSession::save_json`].
    pub fn load_json(path: &Path) -> VitResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Training orchestrator for a [`VisionTransformer`].
pub struct Trainer {
    model: VisionTransformer,
    config: TrainingConfig,
    vars: Vec<Var>,
    optimizer: AdamWOptimizer,
    scheduler: LRScheduler,
    scaler: GradScaler,
    autocast: Autocast,
    rng: ChaCha8Rng,
}

impl Trainer {
    /// Create a trainer.
    ///
    /// Builds AdamW over every model parameter, cosine annealing over
    /// `config.epochs`, the loss scaler and the autocast policy for the model's
    /// device. Augmentation draws come from `config.seed` when set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(model: VisionTransformer, config: TrainingConfig) -> VitResult<Self> {
        config.validate()?;

        let optimizer = OptimizerConfig::from(&config).build_adamw(model.var_map())?;
        // Nothing to anneal when the floor equals the peak rate
        let schedule = if config.min_learning_rate >= config.learning_rate {
            SchedulerType::Constant
        } else {
            SchedulerType::CosineAnnealing {
                t_max: config.epochs,
                eta_min: config.min_learning_rate,
            }
        };
        let scheduler = LRScheduler::new(schedule, config.learning_rate);
        let scaler = GradScaler::new(&config.mixed_precision);
        let autocast = Autocast::for_device(&config.mixed_precision, model.device());
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let vars = model.var_map().all_vars();

        tracing::info!(
            parameters = model.parameter_count(),
            autocast = ?autocast.compute_dtype(),
            seed = ?config.seed,
            "Initialized trainer"
        );

        Ok(Self {
            model,
            config,
            vars,
            optimizer,
            scheduler,
            scaler,
            autocast,
            rng,
        })
    }

    pub fn model(&self) -> &VisionTransformer {
        &self.model
    }

    pub fn into_model(self) -> VisionTransformer {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// Run one epoch of MixUp/CutMix training.
    ///
    /// Each batch picks a strategy at random, runs the forward pass under
    /// autocast, blends the loss over both target sets and takes a scaled
    /// optimizer step. The epoch loss is the mean over batches and the accuracy
    /// is `100 * blended_correct / samples`.
    pub fn train_epoch(
        &mut self,
        mut session: TrainingSession,
        loader: &mut DataLoader,
        epoch: usize,
    ) -> VitResult<(TrainingSession, EpochMetrics)> {
        let num_batches = loader.num_batches();
        if num_batches == 0 {
            return Err(VitError::training("training loader is empty"));
        }
        let total = loader.len();
        let log_every = (num_batches / self.config.log_splits.max(1)).max(1);
        let alpha = self.config.mix_alpha;

        let pb = progress_bar(num_batches);
        let mut total_loss = 0.0;
        let mut total_correct = 0.0;
        let mut total_samples = 0usize;
        let mut batches_done = 0usize;

        for (batch_idx, batch) in loader.epoch().enumerate() {
            let batch = batch?;
            let batch_len = batch.len();

            let strategy = MixStrategy::choose(&mut self.rng);
            let mixed = strategy.apply(&batch.images, &batch.targets, alpha, &mut self.rng)?;

            let logits = self.model.forward_autocast(&mixed.images, &self.autocast)?;
            let loss = mixed.loss(&logits)?;
            let step = self
                .scaler
                .scale_loss_and_step(&loss, &self.vars, &mut self.optimizer)?;
            self.scaler.update(step.found_inf);
            if step.found_inf {
                session.skipped_steps += 1;
            }

            let loss_value = loss.to_scalar::<f32>()? as f64;
            let correct = mixed.correct(&logits.detach())?;
            total_loss += loss_value;
            total_correct += correct;
            total_samples += batch_len;
            batches_done += 1;

            pb.set_message(format!("{loss_value:.4}"));
            pb.inc(1);

            if batch_idx % log_every == 0 {
                tracing::info!(
                    "Epoch {}: [{}/{}] Train Loss: {:.3} | Train Accuracy: {:.3}% ({}, λ={:.2}, scale={})",
                    epoch,
                    batch_idx * batch_len,
                    total,
                    loss_value,
                    100.0 * correct / batch_len.max(1) as f64,
                    strategy,
                    mixed.lambda,
                    self.scaler.scale()
                );
            }
        }
        pb.finish_and_clear();

        let metrics = EpochMetrics {
            loss: total_loss / batches_done.max(1) as f64,
            accuracy: 100.0 * total_correct / total_samples.max(1) as f64,
        };
        session.record_train(metrics);

        tracing::info!(
            "Train Result for Epoch {}: Avg Train Loss: {:.3} | Avg Train Accuracy: {:.3}%",
            epoch,
            metrics.loss,
            metrics.accuracy
        );
        Ok((session, metrics))
    }

    /// Train for `config.epochs` epochs, evaluating after each one.
    ///
    /// The checkpoint at `checkpoint_path` is overwritten whenever the test
    /// loss improves on the best seen so far, and the scheduler is stepped
    /// after every epoch.
    pub fn fit(
        &mut self,
        mut session: TrainingSession,
        train_loader: &mut DataLoader,
        test_loader: &mut DataLoader,
        checkpoint_path: &Path,
    ) -> VitResult<TrainingSession> {
        tracing::info!("Starting training");
        tracing::info!("  Epochs: {}", self.config.epochs);
        tracing::info!("  Batch size: {}", self.config.batch_size);
        tracing::info!("  Train samples: {}", train_loader.len());
        tracing::info!("  Test samples: {}", test_loader.len());

        for epoch in 0..self.config.epochs {
            session.learning_rates.push(self.optimizer.learning_rate());

            let (next, _) = self.train_epoch(session, train_loader, epoch)?;
            session = next;

            let test = evaluate(&self.model, test_loader)?;
            tracing::info!(
                "Test Result for Epoch {}: Avg Test Loss: {:.3} | Avg Test Accuracy: {:.3}%",
                epoch,
                test.loss,
                test.accuracy
            );

            if session.record_test(test) {
                self.model.save(checkpoint_path)?;
                tracing::info!(
                    "** Optimal Checkpoint Saved with Validation Loss: {:.3} **",
                    test.loss
                );
            }

            self.scheduler.step(&mut self.optimizer);
            session.epochs_completed += 1;
        }

        Ok(session)
    }
}

/// Full-precision evaluation with no augmentation and no parameter updates.
///
/// Loss is averaged per sample (batch losses weighted by batch size) and
/// accuracy is the percentage of correct top-1 predictions.
pub fn evaluate(model: &VisionTransformer, loader: &mut DataLoader) -> VitResult<EpochMetrics> {
    let mut total_loss = 0.0;
    let mut correct = 0.0;
    let mut total = 0usize;

    for batch in loader.epoch() {
        let batch = batch?;
        let batch_len = batch.len();

        let logits = model.forward(&batch.images)?.detach();
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.targets)?.to_scalar::<f32>()?;
        total_loss += loss as f64 * batch_len as f64;
        correct += count_matches(&logits.argmax(D::Minus1)?, &batch.targets)?;
        total += batch_len;
    }

    if total == 0 {
        return Err(VitError::training("evaluation loader is empty"));
    }

    Ok(EpochMetrics {
        loss: total_loss / total as f64,
        accuracy: 100.0 * correct / total as f64,
    })
}
