//! Differentiable augmentation of predicted images
//!
//! Before scoring, each predicted clean image is
//!
//! 1. resized to the embedding model's resolution `R` (bicubic),
//! 2. edge-padded by `P / 2` on every side,
//! 3. shifted by a random sub-pixel offset in `[-P / 2, P / 2]` per example
//!    and cropped back to `R x R` (bicubic),
//! 4. mapped from `[-1, 1]` to `[0, 1]` and normalized per channel.
//!
//! Every resample is a separable linear map. The weights are computed on the
//! host and applied with batched `matmul`, so gradients flow back to the
//! image on any autodiff backend.

use burn::prelude::*;
use burn_guided_clip::{EmbeddingModel, ImageNormalization};
use burn_guided_core::RandomKey;

/// Augmentation parameters, fixed by the embedding model
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentConfig {
    /// Square input resolution of the embedding model
    pub resolution: usize,
    /// Edge padding, and the largest shift in either direction
    pub pad: usize,
    /// Per-channel mean and std applied last
    pub normalization: ImageNormalization,
}

impl AugmentConfig {
    /// Creates an augmentation config
    ///
    /// # Arguments
    ///
    /// * `resolution` - Square input size of the image encoder
    /// * `patch_size` - Encoder patch size; shifts reach half a patch
    /// * `normalization` - Channel statistics of the encoder
    pub fn new(resolution: usize, patch_size: usize, normalization: ImageNormalization) -> Self {
        Self {
            resolution,
            pad: patch_size / 2,
            normalization,
        }
    }

    /// Reads resolution, patch size and normalization off `model`
    pub fn for_model<B: Backend, E: EmbeddingModel<B> + ?Sized>(model: &E) -> Self {
        Self::new(
            model.input_resolution(),
            model.patch_size(),
            model.normalization(),
        )
    }
}

/// Keys cubic convolution kernel (`a = -0.5`)
pub fn keys_cubic(x: f32) -> f32 {
    let x = x.abs();
    if x < 1.0 {
        ((1.5 * x - 2.5) * x) * x + 1.0
    } else if x < 2.0 {
        ((-0.5 * x + 2.5) * x - 4.0) * x + 2.0
    } else {
        0.0
    }
}

/// Row-major `[output_size, input_size]` bicubic resampling weights
///
/// Output pixel `i` samples input coordinate
/// `(i + 0.5 - translation) / scale - 0.5`. When downsampling the kernel is
/// widened by `1 / scale` to antialias. Rows are renormalized to sum to one,
/// and rows whose sample falls outside the input are zero.
pub fn resample_weights(
    input_size: usize,
    output_size: usize,
    scale: f32,
    translation: f32,
) -> Vec<f32> {
    let kernel_scale = if scale < 1.0 { 1.0 / scale } else { 1.0 };
    let mut weights = vec![0.0f32; output_size * input_size];

    for (i, row) in weights.chunks_exact_mut(input_size).enumerate() {
        let sample = (i as f32 + 0.5 - translation) / scale - 0.5;
        if sample < -0.5 || sample > input_size as f32 - 0.5 {
            continue;
        }

        for (j, w) in row.iter_mut().enumerate() {
            *w = keys_cubic((sample - j as f32) / kernel_scale);
        }
        let total: f32 = row.iter().sum();
        if total.abs() > 1000.0 * f32::EPSILON {
            row.iter_mut().for_each(|w| *w /= total);
        } else {
            row.fill(0.0);
        }
    }

    weights
}

/// `out[n] = wy[n] . x[n] . wx[n]^T` over every channel
///
/// `wy: [batch, out_h, in_h]`, `wx: [batch, out_w, in_w]`.
fn apply_separable<B: Backend>(x: Tensor<B, 4>, wy: Tensor<B, 3>, wx: Tensor<B, 3>) -> Tensor<B, 4> {
    let [_, channels, _, _] = x.dims();
    let wy = wy.unsqueeze_dim::<4>(1).repeat_dim(1, channels);
    let wx_t = wx.swap_dims(1, 2).unsqueeze_dim::<4>(1).repeat_dim(1, channels);
    wy.matmul(x).matmul(wx_t)
}

fn weight_tensor<B: Backend>(
    rows: Vec<f32>,
    batch: usize,
    output_size: usize,
    input_size: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    Tensor::from_data(
        TensorData::new(rows, [batch, output_size, input_size]),
        device,
    )
}

/// Bicubic resize of `[batch, C, H, W]` to `[batch, C, height, width]`
pub fn resize_bicubic<B: Backend>(x: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, _, h, w] = x.dims();
    if (h, w) == (height, width) {
        return x;
    }
    let device = x.device();

    let wy = resample_weights(h, height, height as f32 / h as f32, 0.0);
    let wx = resample_weights(w, width, width as f32 / w as f32, 0.0);
    let wy = weight_tensor::<B>(wy, 1, height, h, &device).repeat_dim(0, batch);
    let wx = weight_tensor::<B>(wx, 1, width, w, &device).repeat_dim(0, batch);

    apply_separable(x, wy, wx)
}

/// Replicates the border `pad` pixels outward on all four sides
pub fn edge_pad<B: Backend>(x: Tensor<B, 4>, pad: usize) -> Tensor<B, 4> {
    if pad == 0 {
        return x;
    }
    let [n, c, h, w] = x.dims();

    let top = x.clone().slice([0..n, 0..c, 0..1, 0..w]).repeat_dim(2, pad);
    let bottom = x.clone().slice([0..n, 0..c, h - 1..h, 0..w]).repeat_dim(2, pad);
    let x = Tensor::cat(vec![top, x, bottom], 2);

    let h = h + 2 * pad;
    let left = x.clone().slice([0..n, 0..c, 0..h, 0..1]).repeat_dim(3, pad);
    let right = x.clone().slice([0..n, 0..c, 0..h, w - 1..w]).repeat_dim(3, pad);
    Tensor::cat(vec![left, x, right], 3)
}

/// Crops `size x size` out of an image padded by `pad`, shifted per example
///
/// `offsets` holds one `(dy, dx)` pair per example; output pixel `i` reads
/// padded coordinate `i + pad - offset`, so offsets within `[-pad, pad]`
/// never leave the padded image. `offsets.len()` must equal the batch size.
pub(crate) fn translate_crop<B: Backend>(
    x: Tensor<B, 4>,
    offsets: &[[f32; 2]],
    size: usize,
    pad: usize,
) -> Tensor<B, 4> {
    let [batch, _, h, w] = x.dims();
    debug_assert_eq!(offsets.len(), batch, "one offset per example");
    let device = x.device();

    let mut wy = Vec::with_capacity(batch * size * h);
    let mut wx = Vec::with_capacity(batch * size * w);
    for &[dy, dx] in offsets {
        wy.extend(resample_weights(h, size, 1.0, dy - pad as f32));
        wx.extend(resample_weights(w, size, 1.0, dx - pad as f32));
    }

    let wy = weight_tensor::<B>(wy, batch, size, h, &device);
    let wx = weight_tensor::<B>(wx, batch, size, w, &device);
    apply_separable(x, wy, wx)
}

/// Runs the full augmentation on predicted images in `[-1, 1]`
///
/// Returns normalized `[batch, C, R, R]` pixels ready for the image encoder.
pub fn augment<B: Backend>(config: &AugmentConfig, pred: Tensor<B, 4>, key: RandomKey) -> Tensor<B, 4> {
    let [batch, _, _, _] = pred.dims();
    let (r, pad) = (config.resolution, config.pad);

    let x = resize_bicubic(pred, r, r);
    let x = edge_pad(x, pad);

    let extent = pad as f32;
    let draws = key.uniform(2 * batch, -extent, extent);
    let offsets: Vec<[f32; 2]> = draws.chunks_exact(2).map(|d| [d[0], d[1]]).collect();
    let x = translate_crop(x, &offsets, r, pad);

    config.normalization.apply((x + 1.0) / 2.0)
}
