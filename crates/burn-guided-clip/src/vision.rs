//! CLIP vision tower (ViT)

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

use crate::clip::{ClipVisionConfig, TransformerBlock};
use crate::layernorm::LayerNorm;

/// Vision transformer over non-overlapping patches
///
/// Input is a normalized `[batch, 3, image_size, image_size]` tensor; the
/// pooled output is the class token after the final layer norm.
#[derive(Module, Debug)]
pub struct ClipVisionEncoder<B: Backend> {
    pub patch_embedding: Conv2d<B>,
    pub class_embedding: Param<Tensor<B, 1>>,
    pub position_embedding: Param<Tensor<B, 2>>,
    pub pre_layernorm: LayerNorm<B>,
    pub layers: Vec<TransformerBlock<B>>,
    pub post_layernorm: LayerNorm<B>,
    pub image_size: usize,
}

impl<B: Backend> ClipVisionEncoder<B> {
    /// Creates a zero-initialized image encoder
    pub fn new(config: &ClipVisionConfig, device: &B::Device) -> Self {
        let width = config.embed_dim;
        Self {
            patch_embedding: Conv2dConfig::new(
                [3, width],
                [config.patch_size, config.patch_size],
            )
            .with_stride([config.patch_size, config.patch_size])
            .with_bias(false)
            .init(device),
            class_embedding: Param::from_tensor(Tensor::zeros([width], device)),
            position_embedding: Param::from_tensor(Tensor::zeros(
                [config.num_positions(), width],
                device,
            )),
            pre_layernorm: LayerNorm::new(width, device),
            layers: (0..config.num_layers)
                .map(|_| {
                    TransformerBlock::new(width, config.num_heads, config.intermediate_size, device)
                })
                .collect(),
            post_layernorm: LayerNorm::new(width, device),
            image_size: config.image_size,
        }
    }

    /// Hidden states for the class token followed by every patch
    pub fn forward(&self, pixels: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, _, height, width] = pixels.dims();
        assert_eq!(
            [height, width],
            [self.image_size, self.image_size],
            "vision tower expects {0}x{0} input",
            self.image_size
        );

        let patches = self.patch_embedding.forward(pixels);
        let [_, dim, grid_h, grid_w] = patches.dims();
        let patches = patches.reshape([batch, dim, grid_h * grid_w]).swap_dims(1, 2);

        let class = self
            .class_embedding
            .val()
            .reshape([1, 1, dim])
            .repeat_dim(0, batch);
        let x = Tensor::cat(vec![class, patches], 1)
            + self.position_embedding.val().unsqueeze::<3>();

        let mut x = self.pre_layernorm.forward(x);
        for layer in &self.layers {
            x = layer.forward(x, None);
        }
        x
    }

    /// Pooled class-token embedding, `[batch, embed_dim]`
    pub fn forward_pooled(&self, pixels: Tensor<B, 4>) -> Tensor<B, 2> {
        let hidden = self.forward(pixels);
        let [batch, _, dim] = hidden.dims();
        let class = hidden.slice([0..batch, 0..1, 0..dim]).reshape([batch, dim]);
        self.post_layernorm.forward(class)
    }
}
