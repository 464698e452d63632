//! Image loading and saving
//!
//! Sample tensors live in `[-1, 1]` with layout `[batch, channels, height, width]`.
//! Pixel values map as `p = round(clamp((x + 1) * 127.5, 0, 255))` on the way
//! out and `x = p / 127.5 - 1` on the way in.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Expected 1 or 3 channels, got {0}")]
    Channels(usize),

    #[error("Tensor data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decodes an image file, guessing the format from its contents
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage, ImageIoError> {
    let path = path.as_ref();
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|source| ImageIoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    reader.decode().map_err(|source| ImageIoError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads an image as RGB and resizes it to exactly `width` x `height` (Lanczos)
pub fn load_rgb_resized(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
) -> Result<RgbImage, ImageIoError> {
    let image = load_image(path)?.to_rgb8();
    if image.dimensions() == (width, height) {
        return Ok(image);
    }
    Ok(image::imageops::resize(
        &image,
        width,
        height,
        FilterType::Lanczos3,
    ))
}

/// Converts an RGB image to a `[1, 3, height, width]` tensor in `[-1, 1]`
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (w, h) = image.dimensions();
    let (w, h) = (w as usize, h as usize);
    let mut chw = vec![0.0f32; 3 * h * w];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            chw[c * h * w + y * w + x] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    Tensor::from_data(TensorData::new(chw, [1, 3, h, w]), device)
}

/// Converts a `[batch, channels, height, width]` tensor in `[-1, 1]` to RGB images
///
/// Single-channel tensors are written as gray RGB.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>, ImageIoError> {
    let [batch, channels, h, w] = tensor.dims();
    if channels != 1 && channels != 3 {
        return Err(ImageIoError::Channels(channels));
    }

    let pixels = ((tensor + 1.0) * 127.5).clamp(0.0, 255.0);
    let floats: Vec<f32> = pixels
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| ImageIoError::Data(format!("{e:?}")))?;

    let plane = h * w;
    let images = (0..batch)
        .map(|n| {
            let base = n * channels * plane;
            RgbImage::from_fn(w as u32, h as u32, |x, y| {
                let offset = y as usize * w + x as usize;
                let channel = |c: usize| {
                    let c = if channels == 1 { 0 } else { c };
                    floats[base + c * plane + offset].round() as u8
                };
                image::Rgb([channel(0), channel(1), channel(2)])
            })
        })
        .collect();

    Ok(images)
}

/// File name for the image at `index` in the overall output sequence
pub fn output_file_name(index: usize) -> String {
    format!("out_{index:05}.png")
}

/// Saves images as `out_{first_index + j:05}.png` under `dir`
pub fn save_images(
    images: &[RgbImage],
    first_index: usize,
    dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>, ImageIoError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut saved = Vec::with_capacity(images.len());
    for (j, image) in images.iter().enumerate() {
        let path = dir.join(output_file_name(first_index + j));
        image.save(&path).map_err(|source| ImageIoError::Save {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "saved image");
        saved.push(path);
    }
    Ok(saved)
}
