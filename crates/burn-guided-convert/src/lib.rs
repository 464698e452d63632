//! Weight loading from `.safetensors` checkpoints
//!
//! - [`load_clip`] - HuggingFace-layout CLIP checkpoints (both towers)
//! - [`load_gaussian_denoiser`] - per-channel statistics for the Gaussian denoiser

pub mod clip_loader;
pub mod denoiser_loader;
pub mod loader;

pub use clip_loader::{ClipLoadError, load_clip};
pub use denoiser_loader::{DenoiserLoadError, load_gaussian_denoiser};
pub use loader::{LoadError, SafeTensorFile, save_f32};
