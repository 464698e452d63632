//! Statistics checkpoints for [`GaussianDenoiser`]
//!
//! The file holds two f32 tensors, `mean` and `std`, each with one value per
//! image channel.

use std::path::Path;

use burn::prelude::*;
use burn_guided_samplers::GaussianDenoiser;
use thiserror::Error;

use crate::loader::{LoadError, SafeTensorFile};

#[derive(Debug, Error)]
pub enum DenoiserLoadError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Standard deviation must be positive, got {0}")]
    NonPositiveStd(f32),
}

/// Loads per-channel prior statistics for an image of `shape = [C, H, W]`
pub fn load_gaussian_denoiser<B: Backend, P: AsRef<Path>>(
    path: P,
    shape: [usize; 3],
    device: &B::Device,
) -> Result<GaussianDenoiser<B>, DenoiserLoadError> {
    let path = path.as_ref();
    let [channels, _, _] = shape;
    let file = SafeTensorFile::open(path)?;

    let mean: Tensor<B, 1> = file.load_f32_checked("mean", [channels], device)?;
    let std: Tensor<B, 1> = file.load_f32_checked("std", [channels], device)?;

    let min_std: f32 = std.clone().min().into_scalar().elem();
    if min_std <= 0.0 || min_std.is_nan() {
        return Err(DenoiserLoadError::NonPositiveStd(min_std));
    }

    tracing::info!(path = %path.display(), channels, "loaded gaussian denoiser statistics");
    Ok(GaussianDenoiser::new(shape, mean, std))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::save_f32;
    use burn_guided_samplers::Denoiser;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_loads_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaussian.safetensors");
        save_f32(
            &path,
            &[
                ("mean", vec![3], vec![0.1, 0.2, 0.3]),
                ("std", vec![3], vec![0.5, 0.4, 0.3]),
            ],
        )
        .unwrap();

        let device = Default::default();
        let model: GaussianDenoiser<TestBackend> =
            load_gaussian_denoiser(&path, [3, 8, 8], &device).unwrap();
        assert_eq!(model.shape(), [3, 8, 8]);

        // at t = 1 the posterior mean is the prior mean
        let clean = model.predict_clean(Tensor::zeros([1, 3, 8, 8], &device), Tensor::ones([1], &device));
        let values = clean.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 0.1).abs() < 1e-5);
        assert!((values[64] - 0.2).abs() < 1e-5);
        assert!((values[128] - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_channel_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaussian.safetensors");
        save_f32(&path, &[("mean", vec![1], vec![0.0]), ("std", vec![1], vec![1.0])]).unwrap();

        let device = Default::default();
        let err = load_gaussian_denoiser::<TestBackend, _>(&path, [3, 8, 8], &device).unwrap_err();
        assert!(matches!(
            err,
            DenoiserLoadError::Load(LoadError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_std() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaussian.safetensors");
        save_f32(&path, &[("mean", vec![1], vec![0.0]), ("std", vec![1], vec![0.0])]).unwrap();

        let device = Default::default();
        let err = load_gaussian_denoiser::<TestBackend, _>(&path, [1, 2, 2], &device).unwrap_err();
        assert!(matches!(err, DenoiserLoadError::NonPositiveStd(v) if v == 0.0));
    }
}
