//! The Vision Transformer classifier.
//!
//! Pipeline per forward call:
//! - patchify with a 16x16 stride-16 convolution
//! - prepend the learned class token
//! - add the sinusoidal positional encoding
//! - run the encoder blocks in order
//! - classify the class-token output with LayerNorm + Linear
//!
//! Every learned tensor lives in the model's [`VarMap`] under a hierarchical
//! name (`patch_embedding.weight`, `blocks.3.attention.query.bias`, ...). The
//! same names are the keys of the safetensors checkpoint.

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Module, VarBuilder, VarMap};
use tracing::{debug, info};

use crate::amp::Autocast;
use crate::config::VitConfig;
use crate::error::{VitError, VitResult};
use crate::layer::TransformerEncoderBlock;
use crate::linear::{CastLinear, PatchEmbedding};
use crate::norm::{layer_norm, LayerNorm};
use crate::positional::PositionalEncoding;

/// Vision Transformer image classifier
pub struct VisionTransformer {
    patch_embedding: PatchEmbedding,
    class_token: Tensor,
    positional: PositionalEncoding,
    blocks: Vec<TransformerEncoderBlock>,
    head_norm: LayerNorm,
    head: CastLinear,
    config: VitConfig,
    device: Device,
    /// VarMap for accessing parameters
    var_map: VarMap,
}

impl std::fmt::Debug for VisionTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionTransformer")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl VisionTransformer {
    /// Create a new model with random initialization
    ///
    /// # Errors
    ///
    /// Returns [`VitError::InvalidConfig`] if the configuration is invalid,
    /// e.g. `num_heads` does not divide `embedding_dim`.
    pub fn new(config: &VitConfig, device: &Device) -> VitResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, device, var_map)
    }

    /// Create model from a VarBuilder backed by `var_map`
    pub fn from_varbuilder(
        config: &VitConfig,
        vb: VarBuilder,
        device: &Device,
        var_map: VarMap,
    ) -> VitResult<Self> {
        config.validate()?;
        let d = config.embedding_dim;

        let patch_embedding = PatchEmbedding::new(config.in_channels, d, vb.pp("patch_embedding"))?;
        let class_token =
            vb.get_with_hints((1, 1, d), "class_token", candle_nn::Init::Const(0.0))?;
        let positional = PositionalEncoding::new(d, config.seq_len(), device)?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(TransformerEncoderBlock::new(config, vb.pp(format!("blocks.{i}")))?);
        }

        let head_norm = layer_norm(d, config.layer_norm_eps, vb.pp("head.norm"))?;
        let head = CastLinear::new(d, config.num_classes, vb.pp("head.linear"))?;

        debug!(
            layers = config.num_layers,
            embedding_dim = d,
            parameters = config.parameter_count(),
            "built vision transformer"
        );

        Ok(Self {
            patch_embedding,
            class_token,
            positional,
            blocks,
            head_norm,
            head,
            config: config.clone(),
            device: device.clone(),
            var_map,
        })
    }

    fn check_input(&self, images: &Tensor) -> VitResult<()> {
        let (_, channels, height, width) = images.dims4()?;
        if channels != self.config.in_channels {
            return Err(VitError::shape_mismatch(
                format!("{} input channels", self.config.in_channels),
                format!("{channels}"),
            ));
        }
        let size = self.config.image_size;
        if height != size || width != size {
            return Err(VitError::shape_mismatch(
                format!("{size}x{size} images"),
                format!("{height}x{width}"),
            ));
        }
        Ok(())
    }

    fn forward_with(&self, images: &Tensor, compute: DType) -> VitResult<Tensor> {
        self.check_input(images)?;
        let batch = images.dim(0)?;
        let d = self.config.embedding_dim;

        let patches = self.patch_embedding.forward_as(images, compute)?;
        let class_token = self.class_token.broadcast_as((batch, 1, d))?.contiguous()?;
        let tokens = Tensor::cat(&[&class_token, &patches], 1)?;
        let mut hidden = self.positional.add_to(&tokens)?;

        for block in &self.blocks {
            hidden = block.forward_as(&hidden, compute)?;
        }

        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        let cls = self.head_norm.forward(&cls)?;
        let logits = self.head.forward_as(&cls, compute)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Full-precision forward pass.
    ///
    /// Input `(batch, in_channels, image_size, image_size)`, output logits
    /// `(batch, num_classes)` in F32.
    pub fn forward(&self, images: &Tensor) -> VitResult<Tensor> {
        self.forward_with(images, DType::F32)
    }

    /// Forward pass with matmuls and convolutions in the autocast dtype.
    ///
    /// Normalisation and softmax stay in F32 and the returned logits are F32.
    pub fn forward_autocast(&self, images: &Tensor, autocast: &Autocast) -> VitResult<Tensor> {
        self.forward_with(images, autocast.compute_dtype())
    }

    /// Top-1 class index per image.
    pub fn predict(&self, images: &Tensor) -> VitResult<Vec<u32>> {
        let logits = self.forward(images)?;
        Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
    }

    /// Get total parameter count
    pub fn parameter_count(&self) -> usize {
        self.config.parameter_count()
    }

    /// Get model configuration
    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    /// Get device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get number of encoder blocks
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Get reference to VarMap for gradient computation
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Save model weights to file (safetensors format).
    pub fn save(&self, path: &Path) -> VitResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.var_map.save(path)?;
        debug!(path = %path.display(), "saved checkpoint");
        Ok(())
    }

    /// Build a model for `config` and assign the checkpoint's tensors by name.
    ///
    /// # Errors
    ///
    /// Returns [`VitError::Checkpoint`] when the file's tensor names or shapes
    /// do not match the architecture described by `config`.
    pub fn load(config: &VitConfig, path: &Path, device: &Device) -> VitResult<Self> {
        let model = Self::new(config, device)?;
        model.load_weights(path)?;
        info!(path = %path.display(), "loaded checkpoint");
        Ok(model)
    }

    /// Load weights into this model, replacing every parameter value.
    pub fn load_weights(&self, path: &Path) -> VitResult<()> {
        let saved = candle_core::safetensors::load(path, &self.device)?;
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| VitError::checkpoint("parameter map lock poisoned"))?;

        if saved.len() != data.len() {
            return Err(VitError::checkpoint(format!(
                "{} holds {} tensors, model has {}",
                path.display(),
                saved.len(),
                data.len()
            )));
        }

        for (name, var) in data.iter() {
            let tensor = saved.get(name).ok_or_else(|| {
                VitError::checkpoint(format!("{} has no tensor named {name}", path.display()))
            })?;
            if tensor.dims() != var.dims() {
                return Err(VitError::checkpoint(format!(
                    "{name}: checkpoint shape {:?}, model shape {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape() {
        let config = VitConfig::test();
        let device = Device::Cpu;
        let model = VisionTransformer::new(&config, &device).unwrap();

        for batch in [1, 2] {
            let images = Tensor::randn(0.0f32, 1.0, (batch, 3, 224, 224), &device).unwrap();
            let logits = model.forward(&images).unwrap();
            assert_eq!(logits.dims(), &[batch, config.num_classes]);
            assert_eq!(logits.dtype(), DType::F32);
        }
    }

    #[test]
    fn test_grayscale_model() {
        let mut config = VitConfig::test();
        config.in_channels = 1;
        let device = Device::Cpu;
        let model = VisionTransformer::new(&config, &device).unwrap();

        let images = Tensor::randn(0.0f32, 1.0, (2, 1, 224, 224), &device).unwrap();
        assert_eq!(model.forward(&images).unwrap().dims(), &[2, 10]);
    }

    #[test]
    fn test_channel_mismatch() {
        let config = VitConfig::test();
        let device = Device::Cpu;
        let model = VisionTransformer::new(&config, &device).unwrap();

        let images = Tensor::randn(0.0f32, 1.0, (1, 1, 224, 224), &device).unwrap();
        let err = model.forward(&images).unwrap_err();
        assert!(matches!(err, VitError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut config = VitConfig::test();
        config.num_heads = 3;
        let err = VisionTransformer::new(&config, &Device::Cpu).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_parameter_count_matches_varmap() {
        let config = VitConfig::test();
        let model = VisionTransformer::new(&config, &Device::Cpu).unwrap();

        let counted: usize = model
            .var_map()
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum();
        assert_eq!(counted, model.parameter_count());
    }

    #[test]
    fn test_checkpoint_names() {
        let config = VitConfig::test();
        let model = VisionTransformer::new(&config, &Device::Cpu).unwrap();
        let data = model.var_map().data().lock().unwrap();

        assert!(data.contains_key("patch_embedding.weight"));
        assert!(data.contains_key("class_token"));
        assert!(data.contains_key("blocks.0.attention.query.weight"));
        assert!(data.contains_key("blocks.1.norm2.bias"));
        assert!(data.contains_key("head.linear.weight"));
    }

    #[test]
    fn test_predict_returns_one_class_per_image() {
        let config = VitConfig::test();
        let device = Device::Cpu;
        let model = VisionTransformer::new(&config, &device).unwrap();

        let images = Tensor::randn(0.0f32, 1.0, (3, 3, 224, 224), &device).unwrap();
        let classes = model.predict(&images).unwrap();
        assert_eq!(classes.len(), 3);
        assert!(classes.iter().all(|&c| (c as usize) < config.num_classes));
    }
}
