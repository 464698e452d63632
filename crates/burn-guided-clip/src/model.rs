//! Two-tower CLIP model with projections into the shared space

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::clip::{ClipConfig, ClipTextEncoder};
use crate::vision::ClipVisionEncoder;

/// CLIP text and image towers
///
/// Both towers' pooled outputs are projected to `projection_dim`, where
/// text and image embeddings are compared.
#[derive(Module, Debug)]
pub struct ClipModel<B: Backend> {
    /// Text tower
    pub text: ClipTextEncoder<B>,
    /// Image tower
    pub vision: ClipVisionEncoder<B>,
    /// Pooled text state to the shared space
    pub text_projection: Linear<B>,
    /// Pooled image state to the shared space
    pub visual_projection: Linear<B>,
}

impl<B: Backend> ClipModel<B> {
    /// Randomly initialized model; use the convert crate to load weights
    pub fn new(config: &ClipConfig, device: &B::Device) -> Self {
        Self {
            text: ClipTextEncoder::new(&config.text, device),
            vision: ClipVisionEncoder::new(&config.vision, device),
            text_projection: LinearConfig::new(config.text.embed_dim, config.projection_dim)
                .with_bias(false)
                .init(device),
            visual_projection: LinearConfig::new(config.vision.embed_dim, config.projection_dim)
                .with_bias(false)
                .init(device),
        }
    }

    /// Token ids `[batch, context]` to embeddings `[batch, projection_dim]`
    pub fn encode_text(&self, token_ids: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        self.text_projection.forward(self.text.forward_pooled(token_ids))
    }

    /// Normalized pixels `[batch, 3, R, R]` to embeddings `[batch, projection_dim]`
    pub fn encode_image(&self, pixels: Tensor<B, 4>) -> Tensor<B, 2> {
        self.visual_projection.forward(self.vision.forward_pooled(pixels))
    }
}
