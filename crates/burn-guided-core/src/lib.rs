//! Core building blocks for guided diffusion sampling
//!
//! - [`RandomKey`] - splittable, single-use randomness
//! - [`image_io`] - conversion between `[-1, 1]` tensors and RGB images

pub mod image_io;
pub mod key;

pub use image_io::{
    ImageIoError, image_to_tensor, load_image, load_rgb_resized, output_file_name, save_images,
    tensor_to_images,
};
pub use key::RandomKey;
