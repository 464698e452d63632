//! Small stand-ins for unit tests

use burn::prelude::*;
use burn_guided_clip::{EmbedError, EmbeddingModel, ImageNormalization};

/// Embeds text as its first four bytes and images as channel means plus one
pub struct ToyEmbedder;

pub const TOY_DIM: usize = 4;

impl<B: Backend> EmbeddingModel<B> for ToyEmbedder {
    fn input_resolution(&self) -> usize {
        8
    }

    fn patch_size(&self) -> usize {
        4
    }

    fn normalization(&self) -> ImageNormalization {
        ImageNormalization::CLIP
    }

    fn tokenize(&self, text: &str, device: &B::Device) -> Result<Tensor<B, 2, Int>, EmbedError> {
        let mut ids = vec![0i64; TOY_DIM];
        for (id, byte) in ids.iter_mut().zip(text.bytes()) {
            *id = byte as i64;
        }
        Ok(Tensor::from_data(TensorData::new(ids, [1, TOY_DIM]), device))
    }

    fn encode_text(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        tokens.float()
    }

    fn encode_image(&self, pixels: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, h, w] = pixels.dims();
        let means = pixels.reshape([batch, channels, h * w]).mean_dim(2).reshape([batch, channels]);
        let ones = Tensor::ones([batch, 1], &means.device());
        Tensor::cat(vec![means, ones], 1)
    }
}
