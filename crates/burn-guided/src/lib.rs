//! burn-guided: embedding-guided diffusion sampling in pure Rust
//!
//! Steers a v-objective diffusion model toward text prompts and reference
//! images. At every sampling step the denoiser's clean-image estimate is
//! augmented, embedded with CLIP, and scored by spherical distance to the
//! targets; the gradient of that score with respect to the noisy image
//! corrects the DDIM step.
//!
//! # Backend Selection
//!
//! Guidance differentiates through the denoiser and the image encoder, so
//! sampling runs on an autodiff backend. Choose the inner backend via
//! feature flags:
//! - `ndarray`: CPU backend (default)
//! - `wgpu`: WebGPU backend (cross-platform GPU)
//!
//! # Example
//!
//! ```ignore
//! use burn_guided::backends::{DefaultBackend, default_device};
//! use burn_guided::{
//!     DenoiserRegistry, GuidedSampleConfig, GuidedSampler, PromptSpec, RandomKey,
//!     collect_targets, run_batches,
//! };
//!
//! let device = default_device();
//! let denoiser = DenoiserRegistry::<DefaultBackend>::with_builtin().load("gaussian", None, &device)?;
//! let clip = /* ClipEmbedder, see burn_guided::clip */;
//!
//! let prompts = PromptSpec::parse("a lighthouse at dusk:2|watercolor")?;
//! let targets = collect_targets(&clip, &prompts, &PromptSpec::default(), &device)?;
//!
//! let config = GuidedSampleConfig::default().with_steps(250).with_n(4).with_batch_size(2);
//! let sampler = GuidedSampler::new(denoiser.as_ref(), &clip, &targets, config, &device);
//! let report = run_batches(&sampler, RandomKey::new(0), &AtomicBool::new(false), |_| {})?;
//! ```

pub use burn_guided_clip as clip;
pub use burn_guided_convert as convert;
pub use burn_guided_core as core;
pub use burn_guided_samplers as samplers;

pub use burn_guided_core::RandomKey;
pub use burn_guided_samplers::{Denoiser, DenoiserArgs, SampleError, StepInfo};

pub mod augment;
pub mod backends;
pub mod config;
pub mod driver;
pub mod guidance;
pub mod loss;
pub mod models;
pub mod prompt;
pub mod sampling;
pub mod targets;

#[cfg(test)]
mod testing;

pub use augment::{AugmentConfig, augment};
pub use config::{ConfigError, GuidedSampleConfig};
pub use driver::{BatchProgress, DriverError, DriverReport, batch_sizes, run_batches};
pub use guidance::EmbeddingGuidance;
pub use loss::{spherical_distance, weighted_target_loss};
pub use models::{DenoiserRegistry, ModelError, default_checkpoint, resolve_checkpoint};
pub use prompt::{PromptError, PromptSpec, WeightedPrompt};
pub use sampling::{GuidedSampler, build_schedule};
pub use targets::{TargetEmbedding, TargetError, TargetSet, collect_targets};
