//! Model, training and run configuration.
//!
//! [`VitConfig`] describes the single supported architecture (16x16 patches,
//! post-norm encoder blocks). [`TrainingConfig`] carries the optimisation and
//! augmentation hyper-parameters, and [`RunConfig`] is the YAML document the
//! `vit` binary is driven by.

use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::data::DatasetProfile;
use crate::error::{VitError, VitResult};

/// Side length of the square patches cut out of every image.
pub const PATCH_SIZE: usize = 16;

/// Default input resolution.
pub const IMAGE_SIZE: usize = 224;

/// Configuration for the Vision Transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitConfig {
    /// Width of every token embedding
    pub embedding_dim: usize,
    /// Number of attention heads (must divide `embedding_dim`)
    pub num_heads: usize,
    /// Number of encoder blocks
    pub num_layers: usize,
    /// Hidden width of the encoder MLP
    pub mlp_dim: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Input channels: 3 for colour datasets, 1 for grayscale
    pub in_channels: usize,
    /// Square input resolution
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Layer norm epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_image_size() -> usize {
    IMAGE_SIZE
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for VitConfig {
    fn default() -> Self {
        Self::base(DatasetProfile::Cifar10)
    }
}

impl VitConfig {
    /// The 512-wide, 8-layer, 8-head configuration used for CIFAR-10 and MNIST.
    pub fn base(profile: DatasetProfile) -> Self {
        Self {
            embedding_dim: 512,
            num_heads: 8,
            num_layers: 8,
            mlp_dim: 2048,
            num_classes: profile.num_classes(),
            in_channels: profile.channels(),
            image_size: IMAGE_SIZE,
            layer_norm_eps: 1e-5,
        }
    }

    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            embedding_dim: 32,
            num_heads: 4,
            num_layers: 2,
            mlp_dim: 64,
            num_classes: 10,
            in_channels: 3,
            image_size: IMAGE_SIZE,
            layer_norm_eps: 1e-5,
        }
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads
    }

    /// Number of patches along one side of the image
    pub fn grid_size(&self) -> usize {
        self.image_size / PATCH_SIZE
    }

    /// Number of non-overlapping patches per image
    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Token sequence length including the class token
    pub fn seq_len(&self) -> usize {
        self.num_patches() + 1
    }

    /// Exact number of learned scalars
    pub fn parameter_count(&self) -> usize {
        let d = self.embedding_dim;
        let patch_embed = self.in_channels * PATCH_SIZE * PATCH_SIZE * d + d;
        let class_token = d;
        let attention = 4 * (d * d + d);
        let mlp = (d * self.mlp_dim + self.mlp_dim) + (self.mlp_dim * d + d);
        let norms = 2 * 2 * d;
        let block = attention + mlp + norms;
        let head = 2 * d + d * self.num_classes + self.num_classes;

        patch_embed + class_token + self.num_layers * block + head
    }

    /// Check the architectural preconditions.
    ///
    /// # Errors
    ///
    /// Returns [`VitError::InvalidConfig`] naming the violated precondition.
    pub fn validate(&self) -> VitResult<()> {
        if self.embedding_dim == 0 || self.num_heads == 0 {
            return Err(VitError::invalid_config(
                "embedding_dim and num_heads must be > 0",
            ));
        }
        if self.embedding_dim % self.num_heads != 0 {
            return Err(VitError::invalid_config(format!(
                "embedding_dim ({}) must be divisible by num_heads ({})",
                self.embedding_dim, self.num_heads
            )));
        }
        if self.num_layers == 0 || self.mlp_dim == 0 || self.num_classes == 0 {
            return Err(VitError::invalid_config(
                "num_layers, mlp_dim and num_classes must be > 0",
            ));
        }
        if !matches!(self.in_channels, 1 | 3) {
            return Err(VitError::invalid_config(format!(
                "in_channels must be 1 or 3, got {}",
                self.in_channels
            )));
        }
        if self.image_size == 0 || self.image_size % PATCH_SIZE != 0 {
            return Err(VitError::invalid_config(format!(
                "image_size ({}) must be a positive multiple of the patch size ({PATCH_SIZE})",
                self.image_size
            )));
        }
        Ok(())
    }
}

/// Reduced-precision dtype used inside the autocast region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmpDtype {
    /// IEEE half precision (needs loss scaling)
    #[default]
    F16,
    /// bfloat16
    Bf16,
}

impl AmpDtype {
    /// The candle dtype for this precision.
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

/// Mixed-precision settings: autocast dtype and the dynamic loss-scale policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedPrecisionConfig {
    /// Run the forward pass in reduced precision
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reduced-precision dtype
    #[serde(default)]
    pub dtype: AmpDtype,
    /// Initial loss scale
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
    /// Scale multiplier after `growth_interval` finite steps
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    /// Scale multiplier after an overflowing step
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Consecutive finite steps before the scale grows
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
}

fn default_true() -> bool {
    true
}
fn default_init_scale() -> f64 {
    65536.0
}
fn default_growth_factor() -> f64 {
    2.0
}
fn default_backoff_factor() -> f64 {
    0.5
}
fn default_growth_interval() -> usize {
    2000
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dtype: AmpDtype::default(),
            init_scale: default_init_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Images per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Peak AdamW learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Cosine annealing floor.
    #[serde(default = "default_min_lr")]
    pub min_learning_rate: f64,
    /// Beta(alpha, alpha) shape for MixUp and CutMix.
    #[serde(default = "default_mix_alpha")]
    pub mix_alpha: f64,
    /// Mixed-precision settings.
    #[serde(default)]
    pub mixed_precision: MixedPrecisionConfig,
    /// Progress lines logged per epoch.
    #[serde(default = "default_log_splits")]
    pub log_splits: usize,
    /// Seed for augmentation and shuffling; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_epochs() -> usize {
    5
}
fn default_batch_size() -> usize {
    32
}
fn default_lr() -> f64 {
    1e-4
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_min_lr() -> f64 {
    1e-6
}
fn default_mix_alpha() -> f64 {
    0.4
}
fn default_log_splits() -> usize {
    9
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            weight_decay: default_weight_decay(),
            min_learning_rate: default_min_lr(),
            mix_alpha: default_mix_alpha(),
            mixed_precision: MixedPrecisionConfig::default(),
            log_splits: default_log_splits(),
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Check the optimisation settings.
    ///
    /// # Errors
    ///
    /// Returns [`VitError::InvalidConfig`] for non-positive sizes or rates.
    pub fn validate(&self) -> VitResult<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(VitError::invalid_config("epochs and batch_size must be > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(VitError::invalid_config("learning_rate must be > 0"));
        }
        if self.min_learning_rate < 0.0 || self.min_learning_rate > self.learning_rate {
            return Err(VitError::invalid_config(
                "min_learning_rate must lie in [0, learning_rate]",
            ));
        }
        if !self.mix_alpha.is_finite() {
            return Err(VitError::invalid_config("mix_alpha must be finite"));
        }
        let amp = &self.mixed_precision;
        if !(amp.init_scale > 0.0) || !(amp.growth_factor > 1.0) {
            return Err(VitError::invalid_config(
                "mixed_precision.init_scale must be > 0 and growth_factor > 1",
            ));
        }
        if !(amp.backoff_factor > 0.0 && amp.backoff_factor < 1.0) || amp.growth_interval == 0 {
            return Err(VitError::invalid_config(
                "mixed_precision.backoff_factor must lie in (0, 1) and growth_interval be > 0",
            ));
        }
        Ok(())
    }
}

/// What the binary does after validating its configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Train from scratch, overwriting the checkpoint
    #[default]
    Train,
    /// Load the last checkpoint and classify the inference folder
    Load,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Load => write!(f, "load"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = VitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "load" => Ok(Self::Load),
            other => Err(VitError::invalid_config(format!(
                "unsupported mode '{other}' (expected train or load)"
            ))),
        }
    }
}

/// Top-level run configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Dataset profile.
    pub dataset: DatasetProfile,
    /// Run mode.
    #[serde(default)]
    pub mode: RunMode,
    /// Directory holding the extracted dataset files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where the best checkpoint is written to and loaded from.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Directory for metric history and predictions.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Optional folder of images to classify after training/loading.
    #[serde(default)]
    pub inference_dir: Option<PathBuf>,
    /// Model architecture.
    pub model: VitConfig,
    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("model.safetensors")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl RunConfig {
    /// Sample configuration for a dataset profile.
    pub fn for_dataset(profile: DatasetProfile) -> Self {
        Self {
            dataset: profile,
            mode: RunMode::Train,
            data_dir: default_data_dir(),
            checkpoint_path: default_checkpoint_path(),
            output_dir: default_output_dir(),
            inference_dir: None,
            model: VitConfig::base(profile),
            training: TrainingConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> VitResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> VitResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the whole run before any work starts.
    ///
    /// Checks the architecture and training settings and that the model's
    /// channel and class counts agree with the dataset profile.
    pub fn validate(&self) -> VitResult<()> {
        self.model.validate()?;
        self.training.validate()?;

        if self.model.in_channels != self.dataset.channels() {
            return Err(VitError::shape_mismatch(
                format!("{} input channels for {}", self.dataset.channels(), self.dataset),
                format!("model.in_channels = {}", self.model.in_channels),
            ));
        }
        if self.model.num_classes != self.dataset.num_classes() {
            return Err(VitError::shape_mismatch(
                format!("{} classes for {}", self.dataset.num_classes(), self.dataset),
                format!("model.num_classes = {}", self.model.num_classes),
            ));
        }
        if self.checkpoint_path.as_os_str().is_empty() {
            return Err(VitError::invalid_config("checkpoint_path is required"));
        }
        if let Some(dir) = &self.inference_dir {
            if !dir.is_dir() {
                return Err(VitError::invalid_config(format!(
                    "inference_dir {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}
