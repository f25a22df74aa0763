//! Error types for the ViT trainer.

use thiserror::Error;

/// Result type for ViT operations.
pub type VitResult<T> = Result<T, VitError>;

/// Errors that can occur while building, training or running the model.
#[derive(Debug, Error)]
pub enum VitError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// MixUp/CutMix sampling failed
    #[error("Augmentation error: {0}")]
    Augmentation(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint could not be written or does not match the model
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl VitError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Whether this error is one of the startup-fatal configuration errors.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::ShapeMismatch { .. } | Self::Yaml(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_invalid_config_display() {
        let error = VitError::invalid_config("embedding_dim must be divisible by num_heads");
        assert_eq!(
            error.to_string(),
            "Invalid configuration: embedding_dim must be divisible by num_heads"
        );
        assert!(error.is_config_error());
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = VitError::shape_mismatch("3 input channels", "1");
        assert_eq!(
            error.to_string(),
            "Shape mismatch: expected 3 input channels, got 1"
        );
        assert!(error.is_config_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "model.safetensors");
        let error: VitError = io_error.into();
        assert!(matches!(error, VitError::Io(_)));
        assert!(!error.is_config_error());
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: VitError = candle_error.into();
        assert!(error.to_string().starts_with("Candle error"));
    }

    #[test]
    fn test_yaml_error_is_fatal_config() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: VitError = yaml_error.into();
        assert!(error.is_config_error());
        assert!(error.to_string().contains("Invalid config file"));
    }
}
