//! Denoising model interface
//!
//! A [`Denoiser`] predicts the velocity `v = alpha * eps - sigma * x0` for a
//! batch of noisy images at per-image times `t`.

use std::f32::consts::FRAC_PI_2;

use burn::prelude::*;
use burn_guided_core::RandomKey;

/// Extra, model-specific conditioning forwarded unchanged to the denoiser
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DenoiserArgs {
    /// Class index for class-conditional models
    pub class_label: Option<usize>,
}

/// A pretrained v-objective denoiser
pub trait Denoiser<B: Backend> {
    /// Image shape `[channels, height, width]` the model samples
    fn shape(&self) -> [usize; 3];

    /// Predicts velocity for `x: [batch, C, H, W]` at `t: [batch]`
    ///
    /// `key` is accepted for models with stochastic layers; samplers pass
    /// [`RandomKey::dummy`].
    fn forward(
        &self,
        key: RandomKey,
        x: Tensor<B, 4>,
        t: Tensor<B, 1>,
        args: &DenoiserArgs,
    ) -> Tensor<B, 4>;
}

/// Bayes-optimal denoiser for a per-channel Gaussian image prior
///
/// For data `x0 ~ N(mean_c, std_c^2)` independently per pixel, the posterior
/// mean of the clean image given `x = alpha * x0 + sigma * eps` is closed
/// form, so this model needs no learned weights. It is the built-in model
/// of the command line tool and a reference point for tests.
#[derive(Debug, Clone)]
pub struct GaussianDenoiser<B: Backend> {
    mean: Tensor<B, 1>,
    std: Tensor<B, 1>,
    shape: [usize; 3],
}

impl<B: Backend> GaussianDenoiser<B> {
    /// Creates a denoiser from per-channel statistics
    ///
    /// # Panics
    ///
    /// If `mean` or `std` does not have one entry per channel.
    pub fn new(shape: [usize; 3], mean: Tensor<B, 1>, std: Tensor<B, 1>) -> Self {
        let [channels, _, _] = shape;
        assert_eq!(mean.dims(), [channels], "one mean per channel");
        assert_eq!(std.dims(), [channels], "one std per channel");
        Self { mean, std, shape }
    }

    /// Zero-mean prior with standard deviation 0.5, roughly matching
    /// natural images scaled to `[-1, 1]`
    pub fn standard(shape: [usize; 3], device: &B::Device) -> Self {
        let [channels, _, _] = shape;
        Self::new(
            shape,
            Tensor::zeros([channels], device),
            Tensor::full([channels], 0.5, device),
        )
    }

    /// Posterior mean of the clean image
    pub fn predict_clean(&self, x: Tensor<B, 4>, t: Tensor<B, 1>) -> Tensor<B, 4> {
        let (alpha, sigma) = self.scales(&x, t);
        let (mean, var) = self.prior();
        let residual = x - alpha.clone() * mean.clone();
        let denom = alpha.clone().powi_scalar(2) * var.clone() + sigma.powi_scalar(2);
        mean + alpha * var * residual / denom
    }

    fn scales(&self, x: &Tensor<B, 4>, t: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [batch, _, _, _] = x.dims();
        let angle = t.reshape([batch, 1, 1, 1]) * FRAC_PI_2;
        (angle.clone().cos(), angle.sin())
    }

    fn prior(&self) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [channels, _, _] = self.shape;
        let mean = self.mean.clone().reshape([1, channels, 1, 1]);
        let var = self.std.clone().powi_scalar(2).reshape([1, channels, 1, 1]);
        (mean, var)
    }
}

impl<B: Backend> Denoiser<B> for GaussianDenoiser<B> {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn forward(
        &self,
        _key: RandomKey,
        x: Tensor<B, 4>,
        t: Tensor<B, 1>,
        _args: &DenoiserArgs,
    ) -> Tensor<B, 4> {
        let (alpha, sigma) = self.scales(&x, t);
        let (mean, var) = self.prior();

        let residual = x - alpha.clone() * mean.clone();
        let denom = alpha.clone().powi_scalar(2) * var.clone() + sigma.clone().powi_scalar(2);

        let eps = sigma.clone() * residual.clone() / denom.clone();
        let clean = mean + alpha.clone() * var * residual / denom;

        alpha * eps - sigma * clean
    }
}
