//! Dataset profiles, image transforms and batch loading.
//!
//! - [`DatasetProfile`] - the two supported datasets with their channel count,
//!   label set and transform pipelines
//! - [`Transform`] - resize / random crop / flip / normalize steps
//! - [`ImageDataset`] - random access to `(image, label)` pairs
//! - [`InMemoryDataset`] - CIFAR-10 binary batches, MNIST IDX files, or
//!   synthetic images
//! - [`DataLoader`] - fixed-size batches, shuffled per epoch or in order
//!
//! # Example
//!
//! ```no_run
//! use vit_trainer_rs::data::{DataLoader, DatasetProfile, InMemoryDataset, Split};
//! use candle_core::Device;
//!
//! let profile = DatasetProfile::Cifar10;
//! let dataset = InMemoryDataset::load(profile, "data", Split::Train).unwrap();
//! let mut loader = DataLoader::new(Box::new(dataset), profile.train_transforms(), 32, true, Device::Cpu);
//!
//! for batch in loader.epoch() {
//!     let batch = batch.unwrap();
//!     println!("images: {:?}, targets: {:?}", batch.images.dims(), batch.targets.dims());
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::IMAGE_SIZE;
use crate::error::{VitError, VitResult};

const CIFAR10_CLASSES: [&str; 10] = [
    "Airplane",
    "Automobile",
    "Bird",
    "Cat",
    "Deer",
    "Dog",
    "Frog",
    "Horse",
    "Ship",
    "Truck",
];

const MNIST_CLASSES: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// Per-channel normalisation applied after `ToTensor`: `(x - 0.5) / 0.5`.
pub const NORMALIZE_MEAN: f32 = 0.5;
pub const NORMALIZE_STD: f32 = 0.5;

/// The supported datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetProfile {
    /// 32x32 colour images, 10 classes
    Cifar10,
    /// 28x28 grayscale digits
    Mnist,
}

impl DatasetProfile {
    pub fn channels(self) -> usize {
        match self {
            Self::Cifar10 => 3,
            Self::Mnist => 1,
        }
    }

    pub fn class_names(self) -> &'static [&'static str] {
        match self {
            Self::Cifar10 => &CIFAR10_CLASSES,
            Self::Mnist => &MNIST_CLASSES,
        }
    }

    pub fn num_classes(self) -> usize {
        self.class_names().len()
    }

    /// Training pipeline at the default resolution.
    pub fn train_transforms(self) -> Vec<Transform> {
        self.train_transforms_for(IMAGE_SIZE)
    }

    /// Evaluation pipeline at the default resolution.
    pub fn eval_transforms(self) -> Vec<Transform> {
        self.eval_transforms_for(IMAGE_SIZE)
    }

    /// Training pipeline producing `size x size` images. CIFAR-10 adds
    /// random crops and flips.
    pub fn train_transforms_for(self, size: usize) -> Vec<Transform> {
        match self {
            Self::Cifar10 => vec![
                Transform::Resize { size },
                Transform::RandomResizedCrop {
                    size,
                    scale: (0.8, 1.0),
                    ratio: (3.0 / 4.0, 4.0 / 3.0),
                },
                Transform::RandomHorizontalFlip { p: 0.5 },
                Transform::normalize(),
            ],
            Self::Mnist => self.eval_transforms_for(size),
        }
    }

    /// Deterministic pipeline used for evaluation and inference.
    pub fn eval_transforms_for(self, size: usize) -> Vec<Transform> {
        vec![Transform::Resize { size }, Transform::normalize()]
    }
}

impl fmt::Display for DatasetProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cifar10 => write!(f, "cifar10"),
            Self::Mnist => write!(f, "mnist"),
        }
    }
}

impl FromStr for DatasetProfile {
    type Err = VitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cifar10" => Ok(Self::Cifar10),
            "mnist" => Ok(Self::Mnist),
            other => Err(VitError::invalid_config(format!(
                "unsupported dataset '{other}' (expected cifar10 or mnist)"
            ))),
        }
    }
}

/// Which half of a dataset to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// A single preprocessing step.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Resize to `size x size` (bilinear)
    Resize { size: usize },
    /// Crop a random area/aspect region and resize it to `size x size`
    RandomResizedCrop {
        size: usize,
        scale: (f64, f64),
        ratio: (f64, f64),
    },
    /// Mirror horizontally with probability `p`
    RandomHorizontalFlip { p: f64 },
    /// `(x - mean) / std` on every channel of the `[0, 1]` tensor
    Normalize { mean: f32, std: f32 },
}

impl Transform {
    pub fn normalize() -> Self {
        Self::Normalize {
            mean: NORMALIZE_MEAN,
            std: NORMALIZE_STD,
        }
    }

    /// Whether this step draws from the RNG.
    pub fn is_random(&self) -> bool {
        matches!(
            self,
            Self::RandomResizedCrop { .. } | Self::RandomHorizontalFlip { .. }
        )
    }

    fn apply_geometric<R: Rng + ?Sized>(&self, image: DynamicImage, rng: &mut R) -> DynamicImage {
        match *self {
            Self::Resize { size } => {
                let size = size as u32;
                if image.width() == size && image.height() == size {
                    image
                } else {
                    image.resize_exact(size, size, FilterType::Triangle)
                }
            }
            Self::RandomResizedCrop { size, scale, ratio } => {
                let (x, y, w, h) = random_crop_box(image.width(), image.height(), scale, ratio, rng);
                image
                    .crop_imm(x, y, w, h)
                    .resize_exact(size as u32, size as u32, FilterType::Triangle)
            }
            Self::RandomHorizontalFlip { p } => {
                if rng.gen::<f64>() < p {
                    image.fliph()
                } else {
                    image
                }
            }
            Self::Normalize { .. } => image,
        }
    }
}

/// Sample a crop `(x, y, w, h)` covering a random fraction of the area.
///
/// Ten attempts are made at a random scale and log-uniform aspect ratio; if
/// none fits, the largest centred crop with a clamped ratio is used.
pub fn random_crop_box<R: Rng + ?Sized>(
    width: u32,
    height: u32,
    scale: (f64, f64),
    ratio: (f64, f64),
    rng: &mut R,
) -> (u32, u32, u32, u32) {
    let area = (width * height) as f64;
    let (log_lo, log_hi) = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..10 {
        let target_area = area * rng.gen_range(scale.0..=scale.1);
        let aspect = rng.gen_range(log_lo..=log_hi).exp();

        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.gen_range(0..=width - w);
            let y = rng.gen_range(0..=height - h);
            return (x, y, w, h);
        }
    }

    let in_ratio = width as f64 / height as f64;
    let (w, h) = if in_ratio < ratio.0 {
        (width, (width as f64 / ratio.0).round() as u32)
    } else if in_ratio > ratio.1 {
        ((height as f64 * ratio.1).round() as u32, height)
    } else {
        (width, height)
    };
    ((width - w) / 2, (height - h) / 2, w, h)
}

/// Run `transforms` on `image` and return normalized CHW pixels.
pub fn apply_transforms<R: Rng + ?Sized>(
    image: &DynamicImage,
    transforms: &[Transform],
    channels: usize,
    rng: &mut R,
) -> VitResult<(Vec<f32>, usize, usize)> {
    let mut current = image.clone();
    let mut mean = 0.0f32;
    let mut std = 1.0f32;
    for transform in transforms {
        if let Transform::Normalize { mean: m, std: s } = *transform {
            mean = m;
            std = s;
        } else {
            current = transform.apply_geometric(current, rng);
        }
    }

    let (width, height) = (current.width() as usize, current.height() as usize);
    let raw = match channels {
        1 => current.to_luma8().into_raw(),
        3 => current.to_rgb8().into_raw(),
        other => {
            return Err(VitError::data(format!("unsupported channel count {other}")));
        }
    };

    // HWC bytes -> CHW floats
    let plane = width * height;
    let mut pixels = vec![0f32; channels * plane];
    for (i, byte) in raw.iter().enumerate() {
        let c = i % channels;
        let p = i / channels;
        pixels[c * plane + p] = (*byte as f32 / 255.0 - mean) / std;
    }
    Ok((pixels, height, width))
}

/// Random access to labelled images.
pub trait ImageDataset: Send {
    /// Number of samples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored `(channels, height, width)` before any transform
    fn shape(&self) -> (usize, usize, usize);

    /// Decoded image and its label
    fn sample(&self, idx: usize) -> VitResult<(&DynamicImage, u32)>;
}

/// Images held in memory with their labels.
pub struct InMemoryDataset {
    images: Vec<DynamicImage>,
    labels: Vec<u32>,
    shape: (usize, usize, usize),
}

impl InMemoryDataset {
    /// Create a dataset from decoded images.
    ///
    /// # Errors
    ///
    /// Fails when the image and label counts differ.
    pub fn new(images: Vec<DynamicImage>, labels: Vec<u32>, channels: usize) -> VitResult<Self> {
        if images.len() != labels.len() {
            return Err(VitError::data(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        let (height, width) = images
            .first()
            .map(|img| (img.height() as usize, img.width() as usize))
            .unwrap_or((0, 0));
        Ok(Self {
            images,
            labels,
            shape: (channels, height, width),
        })
    }

    /// Read one split of `profile` from `data_dir`.
    pub fn load(profile: DatasetProfile, data_dir: impl AsRef<Path>, split: Split) -> VitResult<Self> {
        let data_dir = data_dir.as_ref();
        let dataset = match profile {
            DatasetProfile::Cifar10 => Self::cifar10(data_dir, split)?,
            DatasetProfile::Mnist => Self::mnist(data_dir, split)?,
        };
        info!(
            dataset = %profile,
            split = ?split,
            samples = dataset.len(),
            "loaded dataset"
        );
        Ok(dataset)
    }

    /// CIFAR-10 binary batches (`data_batch_{1..5}.bin`, `test_batch.bin`).
    pub fn cifar10(data_dir: &Path, split: Split) -> VitResult<Self> {
        let dir = first_existing(data_dir, &["cifar-10-batches-bin"]);
        let files: Vec<PathBuf> = match split {
            Split::Train => (1..=5)
                .map(|i| dir.join(format!("data_batch_{i}.bin")))
                .collect(),
            Split::Test => vec![dir.join("test_batch.bin")],
        };

        let mut images = Vec::new();
        let mut labels = Vec::new();
        for file in &files {
            let (mut batch_images, mut batch_labels) = read_cifar10_batch(file)?;
            images.append(&mut batch_images);
            labels.append(&mut batch_labels);
        }
        Self::new(images, labels, 3)
    }

    /// MNIST IDX files (`train-*-idx?-ubyte`, `t10k-*-idx?-ubyte`).
    pub fn mnist(data_dir: &Path, split: Split) -> VitResult<Self> {
        let dir = first_existing(data_dir, &["MNIST/raw", "mnist"]);
        let prefix = match split {
            Split::Train => "train",
            Split::Test => "t10k",
        };
        let images = read_idx_images(&dir.join(format!("{prefix}-images-idx3-ubyte")))?;
        let labels = read_idx_labels(&dir.join(format!("{prefix}-labels-idx1-ubyte")))?;
        Self::new(images, labels, 1)
    }

    /// Random-pixel images of `shape = (channels, height, width)` labelled
    /// `i % num_classes`.
    pub fn synthetic(
        len: usize,
        shape: (usize, usize, usize),
        num_classes: usize,
        seed: u64,
    ) -> VitResult<Self> {
        let (channels, height, width) = shape;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut images = Vec::with_capacity(len);
        for _ in 0..len {
            let mut raw = vec![0u8; channels * height * width];
            rng.fill_bytes(&mut raw);
            images.push(image_from_raw(raw, channels, width as u32, height as u32)?);
        }
        let labels = (0..len).map(|i| (i % num_classes.max(1)) as u32).collect();
        Self::new(images, labels, channels)
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

impl ImageDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn sample(&self, idx: usize) -> VitResult<(&DynamicImage, u32)> {
        let image = self
            .images
            .get(idx)
            .ok_or_else(|| VitError::data(format!("index {idx} out of range ({})", self.len())))?;
        Ok((image, self.labels[idx]))
    }
}

fn first_existing(base: &Path, candidates: &[&str]) -> PathBuf {
    candidates
        .iter()
        .map(|c| base.join(c))
        .find(|p| p.is_dir())
        .unwrap_or_else(|| base.to_path_buf())
}

fn image_from_raw(raw: Vec<u8>, channels: usize, width: u32, height: u32) -> VitResult<DynamicImage> {
    let image = match channels {
        1 => GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
        _ => None,
    };
    image.ok_or_else(|| VitError::data(format!("cannot build a {channels}-channel {width}x{height} image")))
}

fn read_file(path: &Path) -> VitResult<Vec<u8>> {
    fs::read(path).map_err(|e| VitError::data(format!("{}: {e}", path.display())))
}

/// Bytes per CIFAR-10 record: one label byte and a 32x32x3 image in CHW order.
const CIFAR_RECORD: usize = 1 + 3 * 32 * 32;

/// Parse one CIFAR-10 binary batch file.
pub fn read_cifar10_batch(path: &Path) -> VitResult<(Vec<DynamicImage>, Vec<u32>)> {
    let bytes = read_file(path)?;
    if bytes.is_empty() || bytes.len() % CIFAR_RECORD != 0 {
        return Err(VitError::data(format!(
            "{}: size {} is not a multiple of {CIFAR_RECORD}",
            path.display(),
            bytes.len()
        )));
    }

    let plane = 32 * 32;
    let mut images = Vec::with_capacity(bytes.len() / CIFAR_RECORD);
    let mut labels = Vec::with_capacity(bytes.len() / CIFAR_RECORD);
    for record in bytes.chunks_exact(CIFAR_RECORD) {
        let label = record[0] as u32;
        if label >= 10 {
            return Err(VitError::data(format!("{}: label {label} out of range", path.display())));
        }
        let chw = &record[1..];
        let mut hwc = vec![0u8; 3 * plane];
        for p in 0..plane {
            for c in 0..3 {
                hwc[p * 3 + c] = chw[c * plane + p];
            }
        }
        images.push(image_from_raw(hwc, 3, 32, 32)?);
        labels.push(label);
    }
    debug!(path = %path.display(), records = labels.len(), "read CIFAR-10 batch");
    Ok((images, labels))
}

const IDX_IMAGES_MAGIC: u32 = 2051;
const IDX_LABELS_MAGIC: u32 = 2049;

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// Parse an IDX3 image file into grayscale images.
pub fn read_idx_images(path: &Path) -> VitResult<Vec<DynamicImage>> {
    let bytes = read_file(path)?;
    if bytes.len() < 16 || be_u32(&bytes, 0) != IDX_IMAGES_MAGIC {
        return Err(VitError::data(format!("{}: not an IDX image file", path.display())));
    }
    let count = be_u32(&bytes, 4) as usize;
    let rows = be_u32(&bytes, 8) as usize;
    let cols = be_u32(&bytes, 12) as usize;
    let size = rows * cols;
    if bytes.len() != 16 + count * size {
        return Err(VitError::data(format!(
            "{}: expected {count} images of {rows}x{cols}",
            path.display()
        )));
    }

    bytes[16..]
        .chunks_exact(size.max(1))
        .map(|chunk| image_from_raw(chunk.to_vec(), 1, cols as u32, rows as u32))
        .collect()
}

/// Parse an IDX1 label file.
pub fn read_idx_labels(path: &Path) -> VitResult<Vec<u32>> {
    let bytes = read_file(path)?;
    if bytes.len() < 8 || be_u32(&bytes, 0) != IDX_LABELS_MAGIC {
        return Err(VitError::data(format!("{}: not an IDX label file", path.display())));
    }
    let count = be_u32(&bytes, 4) as usize;
    if bytes.len() != 8 + count {
        return Err(VitError::data(format!("{}: expected {count} labels", path.display())));
    }
    let labels = &bytes[8..];
    if let Some(label) = labels.iter().find(|&&b| b >= 10) {
        return Err(VitError::data(format!("{}: label {label} out of range", path.display())));
    }
    Ok(labels.iter().map(|&b| b as u32).collect())
}

/// A batch ready for the model.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// `(batch, channels, height, width)` F32
    pub images: Tensor,
    /// `(batch,)` U32 class indices
    pub targets: Tensor,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.targets.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batched iterator over an [`ImageDataset`].
pub struct DataLoader {
    dataset: Box<dyn ImageDataset>,
    transforms: Vec<Transform>,
    batch_size: usize,
    shuffle: bool,
    device: Device,
    rng: ChaCha8Rng,
}

impl DataLoader {
    /// Create a loader drawing shuffles and random transforms from entropy.
    pub fn new(
        dataset: Box<dyn ImageDataset>,
        transforms: Vec<Transform>,
        batch_size: usize,
        shuffle: bool,
        device: Device,
    ) -> Self {
        Self {
            dataset,
            transforms,
            batch_size: batch_size.max(1),
            shuffle,
            device,
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    /// Make shuffling and random transforms reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch, counting a trailing partial batch.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Iterate over one epoch.
    pub fn epoch(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Batches {
            dataset: self.dataset.as_ref(),
            transforms: &self.transforms,
            batch_size: self.batch_size,
            device: &self.device,
            rng: &mut self.rng,
            order,
            cursor: 0,
        }
    }
}

/// One epoch of batches from a [`DataLoader`].
pub struct Batches<'a> {
    dataset: &'a dyn ImageDataset,
    transforms: &'a [Transform],
    batch_size: usize,
    device: &'a Device,
    rng: &'a mut ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
}

impl Batches<'_> {
    fn collate(&mut self, indices: &[usize]) -> VitResult<ImageBatch> {
        let channels = self.dataset.shape().0;
        let mut pixels = Vec::new();
        let mut targets = Vec::with_capacity(indices.len());
        let mut size = (0, 0);

        for &idx in indices {
            let (image, label) = self.dataset.sample(idx)?;
            let (data, height, width) = apply_transforms(image, self.transforms, channels, self.rng)?;
            if pixels.is_empty() {
                size = (height, width);
            } else if size != (height, width) {
                return Err(VitError::data(format!(
                    "mixed image sizes in a batch: {size:?} and {:?}",
                    (height, width)
                )));
            }
            pixels.extend_from_slice(&data);
            targets.push(label);
        }

        let batch = indices.len();
        let images = Tensor::from_vec(pixels, (batch, channels, size.0, size.1), self.device)?;
        let targets = Tensor::from_vec(targets, batch, self.device)?;
        Ok(ImageBatch { images, targets })
    }
}

impl Iterator for Batches<'_> {
    type Item = VitResult<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        Some(self.collate(&indices))
    }
}
