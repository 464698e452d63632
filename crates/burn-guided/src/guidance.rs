//! Embedding-space guidance
//!
//! At each step the denoiser's clean-image estimate is augmented, embedded,
//! and scored against every target. The gradient of the weighted loss with
//! respect to the noisy image, scaled by `-guidance_scale`, is returned to
//! the sampler, which folds it into the velocity.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_guided_clip::EmbeddingModel;
use burn_guided_core::RandomKey;
use burn_guided_samplers::{CondFn, Denoiser, DenoiserArgs, t_to_alpha_sigma};

use crate::augment::{AugmentConfig, augment};
use crate::loss::weighted_target_loss;
use crate::targets::TargetSet;

/// Gradient of the weighted embedding loss, as a [`CondFn`]
///
/// Borrows the denoiser, the embedding model and the targets for the
/// length of one sampling run. With no targets the gradient is zero and
/// nothing is differentiated.
pub struct EmbeddingGuidance<'a, B, D, E>
where
    B: AutodiffBackend,
    D: ?Sized,
    E: ?Sized,
{
    denoiser: &'a D,
    embedder: &'a E,
    targets: &'a TargetSet<B>,
    augment: AugmentConfig,
    scale: f32,
}

impl<'a, B, D, E> EmbeddingGuidance<'a, B, D, E>
where
    B: AutodiffBackend,
    D: Denoiser<B> + ?Sized,
    E: EmbeddingModel<B> + ?Sized,
{
    /// Creates guidance with augmentation matched to `embedder`
    ///
    /// # Arguments
    ///
    /// * `denoiser` - Model whose clean-image estimate is scored
    /// * `embedder` - Image encoder used for scoring
    /// * `targets` - Embeddings to pull toward
    /// * `scale` - Guidance strength; the gradient is multiplied by `-scale`
    pub fn new(denoiser: &'a D, embedder: &'a E, targets: &'a TargetSet<B>, scale: f32) -> Self {
        Self {
            denoiser,
            embedder,
            targets,
            augment: AugmentConfig::for_model(embedder),
            scale,
        }
    }

    /// Replaces the augmentation config
    pub fn with_augment(mut self, augment: AugmentConfig) -> Self {
        self.augment = augment;
        self
    }

    /// Guidance strength
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Total weighted loss of the clean-image estimate at `x`, a `[1]` tensor
    pub fn loss(&self, x: Tensor<B, 4>, key: RandomKey, t: f32, args: &DenoiserArgs) -> Tensor<B, 1> {
        let [batch, _, _, _] = x.dims();
        let device = x.device();

        let t_batch = Tensor::full([batch], t, &device);
        let v = self.denoiser.forward(RandomKey::dummy(), x.clone(), t_batch, args);
        let (alpha, sigma) = t_to_alpha_sigma(t);
        let pred = x * alpha - v * sigma;

        let pixels = augment(&self.augment, pred, key);
        let embeds = self.embedder.encode_image(pixels);

        self.targets
            .iter()
            .map(|target| weighted_target_loss(embeds.clone(), target.embedding.clone(), target.weight))
            .reduce(|total, loss| total + loss)
            .unwrap_or_else(|| Tensor::zeros([1], &device))
    }
}

impl<B, D, E> CondFn<B> for EmbeddingGuidance<'_, B, D, E>
where
    B: AutodiffBackend,
    D: Denoiser<B> + ?Sized,
    E: EmbeddingModel<B> + ?Sized,
{
    fn gradient(&self, x: Tensor<B, 4>, key: RandomKey, t: f32, args: &DenoiserArgs) -> Tensor<B, 4> {
        let x = x.detach();
        if self.targets.is_empty() {
            return x.zeros_like();
        }

        let x = x.require_grad();
        let loss = self.loss(x.clone(), key, t, args);
        if tracing::enabled!(tracing::Level::TRACE) {
            let value: f32 = loss.clone().into_scalar().elem();
            tracing::trace!(t, loss = value, "guidance loss");
        }

        let grads = loss.backward();
        match x.grad(&grads) {
            Some(grad) => Tensor::from_inner(grad) * -self.scale,
            None => x.detach().zeros_like(),
        }
    }
}
