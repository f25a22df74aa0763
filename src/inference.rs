//! Classify a folder of real-world images.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::DynamicImage;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::{apply_transforms, DatasetProfile};
use crate::error::{VitError, VitResult};
use crate::model::VisionTransformer;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Top-1 prediction for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub filename: String,
    pub class_index: usize,
    pub class_name: String,
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Decode every `.png`/`.jpg`/`.jpeg` file in `dir`, sorted by name.
///
/// Files that cannot be opened or decoded are logged and skipped.
pub fn read_image_folder(dir: &Path) -> VitResult<Vec<(DynamicImage, String)>> {
    if !dir.is_dir() {
        return Err(VitError::data(format!("{} is not a directory", dir.display())));
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_image_extension(p))
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match image::open(&path) {
            Ok(image) => images.push((image, filename)),
            Err(err) => warn!("Skipping {}: {err}", path.display()),
        }
    }
    Ok(images)
}

/// Decode the folder and apply the profile's evaluation transforms.
///
/// Each tensor is `(1, channels, image_size, image_size)`; grayscale profiles
/// convert the image to luma first.
pub fn load_images_from_folder(
    dir: &Path,
    profile: DatasetProfile,
    image_size: usize,
    device: &Device,
) -> VitResult<Vec<(Tensor, String)>> {
    let transforms = profile.eval_transforms_for(image_size);
    let channels = profile.channels();
    // Evaluation transforms never draw from the RNG
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    read_image_folder(dir)?
        .into_iter()
        .map(|(image, filename)| -> VitResult<(Tensor, String)> {
            let (pixels, height, width) = apply_transforms(&image, &transforms, channels, &mut rng)?;
            let tensor = Tensor::from_vec(pixels, (1, channels, height, width), device)?;
            Ok((tensor, filename))
        })
        .collect()
}

/// Predict a class for every image in `dir`.
pub fn predict_folder(
    model: &VisionTransformer,
    dir: &Path,
    profile: DatasetProfile,
) -> VitResult<Vec<Prediction>> {
    let class_names = profile.class_names();
    let images = load_images_from_folder(dir, profile, model.config().image_size, model.device())?;

    let mut predictions = Vec::with_capacity(images.len());
    for (tensor, filename) in images {
        let class_index = model
            .predict(&tensor)?
            .first()
            .copied()
            .ok_or_else(|| VitError::training("model returned no prediction"))?
            as usize;
        let class_name = class_names
            .get(class_index)
            .map(|s| s.to_string())
            .unwrap_or_else(|| class_index.to_string());
        info!("{filename}: predicted {class_name}");
        predictions.push(Prediction {
            filename,
            class_index,
            class_name,
        });
    }
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VitConfig;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str) {
        let img = RgbImage::from_pixel(40, 30, Rgb([10, 200, 30]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_skips_unreadable_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "b.png");
        write_png(dir.path(), "a.png");
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let images = read_image_folder(dir.path()).unwrap();
        let names: Vec<&str> = images.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_load_resizes_and_converts() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "digit.png");

        let tensors =
            load_images_from_folder(dir.path(), DatasetProfile::Mnist, 224, &Device::Cpu).unwrap();
        assert_eq!(tensors.len(), 1);
        assert_eq!(tensors[0].0.dims(), &[1, 1, 224, 224]);
    }

    #[test]
    fn test_predict_folder() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "plane.png");

        let model = VisionTransformer::new(&VitConfig::test(), &Device::Cpu).unwrap();
        let predictions = predict_folder(&model, dir.path(), DatasetProfile::Cifar10).unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].filename, "plane.png");
        assert!(predictions[0].class_index < 10);
        assert_eq!(
            predictions[0].class_name,
            DatasetProfile::Cifar10.class_names()[predictions[0].class_index]
        );
    }

    #[test]
    fn test_missing_folder() {
        let err = read_image_folder(Path::new("/nonexistent/images")).unwrap_err();
        assert!(matches!(err, VitError::Data(_)));
    }
}
