//! MixUp and CutMix batch augmentation.
//!
//! Both strategies pair every image with the image at a random permutation
//! index and return the two label sets plus the mixing coefficient λ. The
//! step's loss and accuracy are always blended as
//! `λ·f(targets_a) + (1-λ)·f(targets_b)`, see [`MixedBatch::loss`] and
//! [`MixedBatch::correct`].

use candle_core::{DType, Tensor, D};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use crate::error::{VitError, VitResult};

/// Which mixing strategy produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixStrategy {
    MixUp,
    CutMix,
}

impl MixStrategy {
    /// Pick CutMix or MixUp with equal probability.
    pub fn choose<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.gen::<f64>() < 0.5 {
            Self::CutMix
        } else {
            Self::MixUp
        }
    }

    /// Run this strategy on a batch.
    pub fn apply<R: Rng + ?Sized>(
        self,
        images: &Tensor,
        targets: &Tensor,
        alpha: f64,
        rng: &mut R,
    ) -> VitResult<MixedBatch> {
        match self {
            Self::MixUp => mixup(images, targets, alpha, rng),
            Self::CutMix => cutmix(images, targets, alpha, rng),
        }
    }
}

impl std::fmt::Display for MixStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MixUp => write!(f, "mixup"),
            Self::CutMix => write!(f, "cutmix"),
        }
    }
}

/// A mixed training batch and its blended targets.
#[derive(Debug, Clone)]
pub struct MixedBatch {
    /// Mixed images, same shape as the input batch
    pub images: Tensor,
    /// Original labels (U32)
    pub targets_a: Tensor,
    /// Labels of the permuted partner images (U32)
    pub targets_b: Tensor,
    /// Weight of `targets_a`, in `[0, 1]`
    pub lambda: f64,
    pub strategy: MixStrategy,
}

impl MixedBatch {
    /// `λ·CE(logits, a) + (1-λ)·CE(logits, b)` as a scalar tensor.
    pub fn loss(&self, logits: &Tensor) -> VitResult<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        let loss_a = candle_nn::loss::cross_entropy(&logits, &self.targets_a)?;
        let loss_b = candle_nn::loss::cross_entropy(&logits, &self.targets_b)?;
        Ok(((loss_a * self.lambda)? + (loss_b * (1.0 - self.lambda))?)?)
    }

    /// Blended count of correct top-1 predictions in the batch.
    pub fn correct(&self, logits: &Tensor) -> VitResult<f64> {
        let predicted = logits.argmax(D::Minus1)?;
        let hits_a = count_matches(&predicted, &self.targets_a)?;
        let hits_b = count_matches(&predicted, &self.targets_b)?;
        Ok(self.lambda * hits_a + (1.0 - self.lambda) * hits_b)
    }
}

/// Number of positions where `predicted == targets`.
pub fn count_matches(predicted: &Tensor, targets: &Tensor) -> VitResult<f64> {
    let hits = predicted
        .eq(targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as f64)
}

/// Draw λ ~ Beta(α, α), or 1 when `alpha <= 0`.
pub fn sample_lambda<R: Rng + ?Sized>(alpha: f64, rng: &mut R) -> VitResult<f64> {
    if alpha <= 0.0 {
        return Ok(1.0);
    }
    let beta = Beta::new(alpha, alpha)
        .map_err(|e| VitError::Augmentation(format!("Beta({alpha}, {alpha}): {e}")))?;
    Ok(beta.sample(rng))
}

fn permutation<R: Rng + ?Sized>(batch: usize, rng: &mut R, device: &candle_core::Device) -> VitResult<Tensor> {
    let mut index: Vec<u32> = (0..batch as u32).collect();
    index.shuffle(rng);
    Ok(Tensor::from_vec(index, batch, device)?)
}

/// MixUp: `mixed = λ·images + (1-λ)·images[perm]`.
pub fn mixup<R: Rng + ?Sized>(
    images: &Tensor,
    targets: &Tensor,
    alpha: f64,
    rng: &mut R,
) -> VitResult<MixedBatch> {
    let lambda = sample_lambda(alpha, rng)?;
    let batch = images.dim(0)?;
    let index = permutation(batch, rng, images.device())?;
    let targets_b = targets.index_select(&index, 0)?;

    let mixed = if lambda >= 1.0 {
        images.clone()
    } else {
        let partner = images.index_select(&index, 0)?;
        ((images * lambda)? + (partner * (1.0 - lambda))?)?
    };

    Ok(MixedBatch {
        images: mixed,
        targets_a: targets.clone(),
        targets_b,
        lambda,
        strategy: MixStrategy::MixUp,
    })
}

/// Rectangular region `[x1, x2) x [y1, y2)` replaced by CutMix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutBox {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl CutBox {
    pub fn width(&self) -> usize {
        self.x2 - self.x1
    }

    pub fn height(&self) -> usize {
        self.y2 - self.y1
    }

    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    /// Effective λ after the box was clipped: `1 - area / (W·H)`.
    pub fn lambda(&self, width: usize, height: usize) -> f64 {
        1.0 - self.area() as f64 / (width * height) as f64
    }
}

/// Sample a box of side `W·sqrt(1-λ)` by `H·sqrt(1-λ)` centred uniformly,
/// clipped to the image.
pub fn cut_box<R: Rng + ?Sized>(width: usize, height: usize, lambda: f64, rng: &mut R) -> CutBox {
    let cut_ratio = (1.0 - lambda).clamp(0.0, 1.0).sqrt();
    let cut_w = (width as f64 * cut_ratio) as usize;
    let cut_h = (height as f64 * cut_ratio) as usize;

    let cx = rng.gen_range(0..width);
    let cy = rng.gen_range(0..height);

    CutBox {
        x1: cx.saturating_sub(cut_w / 2),
        y1: cy.saturating_sub(cut_h / 2),
        x2: (cx + cut_w / 2).min(width),
        y2: (cy + cut_h / 2).min(height),
    }
}

/// CutMix: paste the partner image's region inside a random box.
pub fn cutmix<R: Rng + ?Sized>(
    images: &Tensor,
    targets: &Tensor,
    alpha: f64,
    rng: &mut R,
) -> VitResult<MixedBatch> {
    let lambda = sample_lambda(alpha, rng)?;
    let (batch, _, height, width) = images.dims4()?;
    let index = permutation(batch, rng, images.device())?;
    let targets_b = targets.index_select(&index, 0)?;

    let region = cut_box(width, height, lambda, rng);
    let mixed = if region.area() == 0 {
        images.clone()
    } else {
        let mut mask = vec![0f32; height * width];
        for y in region.y1..region.y2 {
            mask[y * width + region.x1..y * width + region.x2].fill(1.0);
        }
        let mask = Tensor::from_vec(mask, (1, 1, height, width), images.device())?
            .to_dtype(images.dtype())?;
        let keep = mask.affine(-1.0, 1.0)?;
        let partner = images.index_select(&index, 0)?;
        (images.broadcast_mul(&keep)? + partner.broadcast_mul(&mask)?)?
    };

    Ok(MixedBatch {
        images: mixed,
        targets_a: targets.clone(),
        targets_b,
        lambda: region.lambda(width, height),
        strategy: MixStrategy::CutMix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn batch(device: &Device) -> (Tensor, Tensor) {
        let images = Tensor::randn(0.0f32, 1.0, (4, 3, 32, 32), device).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2, 3], device).unwrap();
        (images, targets)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_mixup_alpha_zero_is_identity() {
        let device = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let (images, targets) = batch(&device);

        let mixed = mixup(&images, &targets, 0.0, &mut rng).unwrap();
        assert_eq!(mixed.lambda, 1.0);
        assert_eq!(mixed.strategy, MixStrategy::MixUp);
        assert_eq!(max_abs_diff(&mixed.images, &images), 0.0);
        assert_eq!(
            mixed.targets_a.to_vec1::<u32>().unwrap(),
            targets.to_vec1::<u32>().unwrap()
        );
    }

    #[test]
    fn test_mixup_blends_with_partner() {
        let device = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let (images, targets) = batch(&device);

        let mixed = mixup(&images, &targets, 0.4, &mut rng).unwrap();
        assert!((0.0..=1.0).contains(&mixed.lambda));
        assert_eq!(mixed.images.dims(), images.dims());

        // targets_b is a permutation of targets_a
        let mut b = mixed.targets_b.to_vec1::<u32>().unwrap();
        b.sort_unstable();
        assert_eq!(b, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sample_lambda_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for alpha in [0.2, 0.4, 1.0, 5.0] {
            for _ in 0..100 {
                let lambda = sample_lambda(alpha, &mut rng).unwrap();
                assert!((0.0..=1.0).contains(&lambda));
            }
        }
        assert_eq!(sample_lambda(-1.0, &mut rng).unwrap(), 1.0);
    }

    #[test]
    fn test_cut_box_within_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..500 {
            let lambda: f64 = rng.gen();
            let region = cut_box(224, 224, lambda, &mut rng);
            assert!(region.x1 <= region.x2 && region.x2 <= 224);
            assert!(region.y1 <= region.y2 && region.y2 <= 224);

            let effective = region.lambda(224, 224);
            assert!((0.0..=1.0).contains(&effective));
            assert!(effective >= lambda - 1e-9, "clipping can only shrink the box");
        }
    }

    #[test]
    fn test_cutmix_lambda_matches_pasted_area() {
        let device = Device::Cpu;
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let images = Tensor::zeros((2, 1, 16, 16), DType::F32, &device).unwrap();
        let images = Tensor::cat(
            &[
                &images.narrow(0, 0, 1).unwrap(),
                &(images.narrow(0, 1, 1).unwrap() + 1.0).unwrap(),
            ],
            0,
        )
        .unwrap();
        let targets = Tensor::new(&[0u32, 1], &device).unwrap();

        for _ in 0..20 {
            let mixed = cutmix(&images, &targets, 1.0, &mut rng).unwrap();
            assert!((0.0..=1.0).contains(&mixed.lambda));
            assert_eq!(mixed.strategy, MixStrategy::CutMix);

            let b = mixed.targets_b.to_vec1::<u32>().unwrap();
            // Fraction of pixels taken from the partner image
            let first = mixed.images.get(0).unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
            let expected = if b[0] == 1 { 1.0 - mixed.lambda } else { 0.0 };
            assert!((first as f64 - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blended_loss_and_accuracy() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[5.0f32, 0.0], [0.0, 5.0]], &device).unwrap();
        let batch = MixedBatch {
            images: Tensor::zeros((2, 1, 1, 1), DType::F32, &device).unwrap(),
            targets_a: Tensor::new(&[0u32, 1], &device).unwrap(),
            targets_b: Tensor::new(&[1u32, 0], &device).unwrap(),
            lambda: 0.75,
            strategy: MixStrategy::MixUp,
        };

        let correct = batch.correct(&logits).unwrap();
        assert!((correct - 1.5).abs() < 1e-9);

        let loss_a = candle_nn::loss::cross_entropy(&logits, &batch.targets_a)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let loss_b = candle_nn::loss::cross_entropy(&logits, &batch.targets_b)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let loss = batch.loss(&logits).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - (0.75 * loss_a + 0.25 * loss_b)).abs() < 1e-5);
    }

    #[test]
    fn test_choose_picks_both() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let picks: Vec<MixStrategy> = (0..64).map(|_| MixStrategy::choose(&mut rng)).collect();
        assert!(picks.contains(&MixStrategy::MixUp));
        assert!(picks.contains(&MixStrategy::CutMix));
    }
}
