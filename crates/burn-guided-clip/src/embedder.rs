//! Joint text/image embedding interface
//!
//! Guidance only needs a model that maps prompts and images into one space
//! and reports how it wants pixels prepared. [`EmbeddingModel`] is that seam;
//! [`ClipEmbedder`] implements it with CLIP.

use burn::prelude::*;
use image::DynamicImage;
use image::imageops::{self, FilterType};
use thiserror::Error;

use crate::clip::ClipConfig;
use crate::model::ClipModel;
use crate::tokenizer::{ClipTokenizer, TokenizerError};

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),
}

/// Per-channel pixel normalization applied to `[0, 1]` RGB input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageNormalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ImageNormalization {
    /// Statistics used to train OpenAI CLIP
    pub const CLIP: Self = Self {
        mean: [0.481_454_66, 0.457_827_5, 0.408_210_73],
        std: [0.268_629_54, 0.261_302_58, 0.275_777_11],
    };

    /// Normalizes `[batch, 3, H, W]` pixels in `[0, 1]`
    pub fn apply<B: Backend>(&self, pixels: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = pixels.device();
        let mean = Tensor::<B, 1>::from_floats(self.mean, &device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(self.std, &device).reshape([1, 3, 1, 1]);
        (pixels - mean) / std
    }
}

/// A model embedding text and images into a shared space
pub trait EmbeddingModel<B: Backend> {
    /// Side length of the square image input
    fn input_resolution(&self) -> usize;

    /// Patch size of the image tower; bounds the augmentation shift
    fn patch_size(&self) -> usize;

    fn normalization(&self) -> ImageNormalization;

    /// Token ids `[1, context]` for one prompt
    fn tokenize(&self, text: &str, device: &B::Device) -> Result<Tensor<B, 2, Int>, EmbedError>;

    /// `[batch, dim]` embeddings of tokenized prompts
    fn encode_text(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2>;

    /// `[batch, dim]` embeddings of normalized `[batch, 3, R, R]` pixels
    fn encode_image(&self, pixels: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Prepares a decoded image the way the model was trained on
    fn preprocess(&self, image: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
        preprocess_image(image, self.input_resolution(), &self.normalization(), device)
    }
}

/// Resize the short side to `resolution` (bicubic), center crop, normalize
///
/// Returns `[1, 3, resolution, resolution]`.
pub fn preprocess_image<B: Backend>(
    image: &DynamicImage,
    resolution: usize,
    normalization: &ImageNormalization,
    device: &B::Device,
) -> Tensor<B, 4> {
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();
    let r = resolution as u32;

    let (rw, rh) = if w <= h {
        (r, ((r as u64 * h as u64) / w.max(1) as u64) as u32)
    } else {
        (((r as u64 * w as u64) / h.max(1) as u64) as u32, r)
    };
    let resized = imageops::resize(&rgb, rw, rh, FilterType::CatmullRom);

    let left = ((rw - r) as f32 / 2.0).round() as u32;
    let top = ((rh - r) as f32 / 2.0).round() as u32;
    let cropped = imageops::crop_imm(&resized, left, top, r, r).to_image();

    let n = resolution;
    let mut chw = vec![0.0f32; 3 * n * n];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        for c in 0..3 {
            chw[c * n * n + y as usize * n + x as usize] = pixel[c] as f32 / 255.0;
        }
    }

    let pixels = Tensor::from_data(TensorData::new(chw, [1, 3, n, n]), device);
    normalization.apply(pixels)
}

/// CLIP with its tokenizer, weights frozen
#[derive(Debug)]
pub struct ClipEmbedder<B: Backend> {
    model: ClipModel<B>,
    tokenizer: ClipTokenizer,
    config: ClipConfig,
}

impl<B: Backend> ClipEmbedder<B> {
    /// Wraps a loaded model; its parameters are excluded from gradients
    ///
    /// # Arguments
    ///
    /// * `model` - CLIP weights
    /// * `tokenizer` - BPE tokenizer matching the text tower
    /// * `config` - Dimensions `model` was built with
    pub fn new(model: ClipModel<B>, tokenizer: ClipTokenizer, config: ClipConfig) -> Self {
        Self {
            model: model.no_grad(),
            tokenizer,
            config,
        }
    }

    /// Model dimensions
    pub fn config(&self) -> &ClipConfig {
        &self.config
    }
}

impl<B: Backend> EmbeddingModel<B> for ClipEmbedder<B> {
    fn input_resolution(&self) -> usize {
        self.config.vision.image_size
    }

    fn patch_size(&self) -> usize {
        self.config.vision.patch_size
    }

    fn normalization(&self) -> ImageNormalization {
        ImageNormalization::CLIP
    }

    fn tokenize(&self, text: &str, device: &B::Device) -> Result<Tensor<B, 2, Int>, EmbedError> {
        let context = self.config.text.context_length;
        let ids: Vec<i64> = self
            .tokenizer
            .encode_padded(text, context)?
            .into_iter()
            .map(i64::from)
            .collect();
        Ok(Tensor::from_data(TensorData::new(ids, [1, context]), device))
    }

    fn encode_text(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        self.model.encode_text(tokens)
    }

    fn encode_image(&self, pixels: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.encode_image(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_normalization_maps_mean_to_zero() {
        let device = Default::default();
        let norm = ImageNormalization::CLIP;
        let mut data = Vec::new();
        for c in 0..3 {
            data.extend(std::iter::repeat_n(norm.mean[c], 4));
        }
        let pixels = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 3, 2, 2]), &device);
        let out: f32 = norm.apply(pixels).abs().max().into_scalar().elem();
        assert!(out < 1e-6);
    }

    #[test]
    fn test_preprocess_crops_to_square() {
        let device = Default::default();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 20, Rgb([255, 255, 255])));
        let pixels: Tensor<TestBackend, 4> =
            preprocess_image(&image, 16, &ImageNormalization::CLIP, &device);
        assert_eq!(pixels.dims(), [1, 3, 16, 16]);

        // white maps to (1 - mean) / std in every channel
        let values = pixels.into_data().to_vec::<f32>().unwrap();
        let norm = ImageNormalization::CLIP;
        for c in 0..3 {
            let expected = (1.0 - norm.mean[c]) / norm.std[c];
            assert!((values[c * 256 + 17] - expected).abs() < 1e-3);
        }
    }
}
