//! Guided sampling of one batch
//!
//! Builds the schedule, draws the starting latent (optionally a partially
//! noised init image), and hands the loop to the DDIM sampler with
//! [`EmbeddingGuidance`] as the per-step correction.

use std::sync::atomic::AtomicBool;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_guided_clip::EmbeddingModel;
use burn_guided_core::RandomKey;
use burn_guided_samplers::{
    CondFn, DdimConfig, DdimSampler, Denoiser, DenoiserArgs, SampleError, StepInfo, ddpm_schedule,
    linear_timesteps, t_to_alpha_sigma, truncate_below,
};

use crate::config::{ConfigError, GuidedSampleConfig};
use crate::guidance::EmbeddingGuidance;
use crate::targets::TargetSet;

/// Schedule for `steps` steps, keeping only entries below `start` if given
pub fn build_schedule(steps: usize, start: Option<f32>) -> Result<Vec<f32>, SampleError> {
    let schedule = ddpm_schedule(&linear_timesteps(steps));
    let schedule = match start {
        Some(start) => truncate_below(&schedule, start),
        None => schedule,
    };
    if schedule.is_empty() {
        return Err(SampleError::EmptySchedule);
    }
    Ok(schedule)
}

/// Samples batches of images guided toward a [`TargetSet`]
///
/// Holds the run config and, optionally, an init image. Each call to
/// [`sample_batch`](Self::sample_batch) is independent given its key.
pub struct GuidedSampler<'a, B, D, E>
where
    B: AutodiffBackend,
    D: ?Sized,
    E: ?Sized,
{
    denoiser: &'a D,
    embedder: &'a E,
    targets: &'a TargetSet<B>,
    config: GuidedSampleConfig,
    init: Option<Tensor<B, 4>>,
    args: DenoiserArgs,
    device: B::Device,
}

impl<'a, B, D, E> GuidedSampler<'a, B, D, E>
where
    B: AutodiffBackend,
    D: Denoiser<B> + ?Sized,
    E: EmbeddingModel<B> + ?Sized,
{
    /// Creates a sampler starting from pure noise
    ///
    /// # Arguments
    ///
    /// * `denoiser` - v-objective model to sample from
    /// * `embedder` - Image encoder used for guidance
    /// * `targets` - Embeddings to pull toward; empty for unguided sampling
    /// * `config` - Run parameters
    /// * `device` - Device for latents
    pub fn new(
        denoiser: &'a D,
        embedder: &'a E,
        targets: &'a TargetSet<B>,
        config: GuidedSampleConfig,
        device: &B::Device,
    ) -> Self {
        Self {
            denoiser,
            embedder,
            targets,
            config,
            init: None,
            args: DenoiserArgs::default(),
            device: device.clone(),
        }
    }

    /// Starts sampling from `init: [1, C, H, W]` noised to the starting timestep
    pub fn with_init_image(mut self, init: Tensor<B, 4>) -> Result<Self, ConfigError> {
        let dims = init.dims();
        let [c, h, w] = self.denoiser.shape();
        if dims != [1, c, h, w] {
            return Err(ConfigError::InitShape {
                expected: [c, h, w],
                actual: dims,
            });
        }
        self.init = Some(init.detach());
        Ok(self)
    }

    /// Sets extra arguments passed to every denoiser call
    pub fn with_args(mut self, args: DenoiserArgs) -> Self {
        self.args = args;
        self
    }

    /// Run parameters
    pub fn config(&self) -> &GuidedSampleConfig {
        &self.config
    }

    /// Timesteps of one batch, truncated below the starting timestep when
    /// an init image is set
    pub fn schedule(&self) -> Result<Vec<f32>, SampleError> {
        let start = self.init.as_ref().map(|_| self.config.starting_timestep);
        build_schedule(self.config.steps, start)
    }

    /// Starting latent for `n` images at the first scheduled time
    pub fn initial_latent(&self, key: RandomKey, n: usize, t_start: f32) -> Tensor<B, 4> {
        let [c, h, w] = self.denoiser.shape();
        let noise = key.normal([n, c, h, w], &self.device);
        match &self.init {
            Some(init) => {
                let (alpha, sigma) = t_to_alpha_sigma(t_start);
                init.clone().repeat_dim(0, n) * alpha + noise * sigma
            }
            None => noise,
        }
    }

    /// Samples `n` images and returns them in `[-1, 1]`-ish model range
    ///
    /// # Arguments
    ///
    /// * `key` - Split into the starting noise key and the sampler key
    /// * `n` - Number of images in the batch
    /// * `interrupt` - Checked after every step
    /// * `on_step` - Called after every step
    ///
    /// # Errors
    ///
    /// [`SampleError::Interrupted`] if the flag was raised, or
    /// [`SampleError::EmptySchedule`] if no timestep lies below the
    /// starting timestep.
    pub fn sample_batch<F: FnMut(StepInfo)>(
        &self,
        key: RandomKey,
        n: usize,
        interrupt: Option<&AtomicBool>,
        on_step: F,
    ) -> Result<Tensor<B, 4>, SampleError> {
        let (noise_key, sample_key) = key.split();
        let steps = self.schedule()?;
        let x = self.initial_latent(noise_key, n, steps[0]);

        tracing::debug!(n, steps = steps.len(), t_start = steps[0], "sampling batch");

        let guidance = EmbeddingGuidance::new(
            self.denoiser,
            self.embedder,
            self.targets,
            self.config.guidance_scale,
        );
        let ddim = DdimSampler::new(DdimConfig {
            eta: self.config.eta,
        });

        ddim.sample_loop(
            self.denoiser,
            Some(&guidance as &dyn CondFn<B>),
            sample_key,
            x,
            &steps,
            &self.args,
            interrupt,
            on_step,
        )
    }
}
