//! Vision Transformer image classifier on candle.
//!
//! This crate provides:
//! - A ViT with 16x16 patch embedding, a learned class token, sinusoidal
//!   positional encoding and post-norm encoder blocks
//! - MixUp / CutMix batch augmentation with λ-blended loss and accuracy
//! - Mixed-precision training with a dynamic loss scaler
//! - CIFAR-10 and MNIST dataset profiles, safetensors checkpoints and
//!   folder inference
//!
//! # Example
//!
//! ```no_run
//! use vit_trainer_rs::{DatasetProfile, VitConfig, VisionTransformer};
//! use candle_core::{Device, Tensor};
//!
//! let config = VitConfig::base(DatasetProfile::Cifar10);
//! let device = Device::Cpu;
//! let model = VisionTransformer::new(&config, &device).unwrap();
//!
//! let images = Tensor::zeros((2, 3, 224, 224), candle_core::DType::F32, &device).unwrap();
//! let logits = model.forward(&images).unwrap();
//! assert_eq!(logits.dims(), &[2, 10]);
//! ```

pub mod amp;
pub mod attention;
pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod layer;
pub mod linear;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod optimizer;
pub mod positional;
pub mod scheduler;
pub mod trainer;

pub use amp::{Autocast, GradScaler, ScaledStep};
pub use augment::{cutmix, mixup, MixStrategy, MixedBatch};
pub use config::{RunConfig, RunMode, TrainingConfig, VitConfig, PATCH_SIZE};
pub use data::{DataLoader, DatasetProfile, ImageBatch, ImageDataset, InMemoryDataset, Split};
pub use error::{VitError, VitResult};
pub use inference::{predict_folder, Prediction};
pub use model::VisionTransformer;
pub use trainer::{evaluate, EpochMetrics, Trainer, TrainingSession};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::amp::{Autocast, GradScaler};
    pub use crate::augment::{MixStrategy, MixedBatch};
    pub use crate::config::{RunConfig, TrainingConfig, VitConfig};
    pub use crate::data::{DataLoader, DatasetProfile, InMemoryDataset, Split};
    pub use crate::error::{VitError, VitResult};
    pub use crate::model::VisionTransformer;
    pub use crate::trainer::{evaluate, Trainer, TrainingSession};
}
