//! DDIM sampling for v-objective models, with optional gradient conditioning
//!
//! Each step converts the model's velocity prediction into a clean-image
//! estimate `pred = x * alpha - v * sigma` and a noise estimate
//! `eps = x * sigma + v * alpha`, then re-noises `pred` to the next time.
//! `eta` interpolates between deterministic DDIM (`0.0`) and ancestral
//! sampling (`1.0`).
//!
//! A [`CondFn`] steers sampling: its gradient is folded into the velocity as
//! `v' = v - grad * sigma / alpha` before the step is taken.

use std::sync::atomic::{AtomicBool, Ordering};

use burn::prelude::*;
use burn_guided_core::RandomKey;
use thiserror::Error;

use crate::model::{Denoiser, DenoiserArgs};
use crate::schedule::t_to_alpha_sigma;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("The timestep schedule is empty")]
    EmptySchedule,

    #[error("Sampling interrupted")]
    Interrupted,
}

/// Gradient-based conditioning of the sampling trajectory
pub trait CondFn<B: Backend> {
    /// Gradient to add to the velocity at `x` and time `t`
    ///
    /// Must have the same shape as `x`.
    fn gradient(&self, x: Tensor<B, 4>, key: RandomKey, t: f32, args: &DenoiserArgs)
    -> Tensor<B, 4>;
}

/// Progress reported after every completed step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    /// Zero-based index of the step just taken
    pub step: usize,
    /// Number of steps in the schedule
    pub total_steps: usize,
    /// Time the step started from
    pub t: f32,
}

/// DDIM sampler configuration
#[derive(Debug, Clone)]
pub struct DdimConfig {
    /// Amount of fresh noise per step (0.0 = deterministic, 1.0 = ancestral)
    pub eta: f32,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self { eta: 1.0 }
    }
}

/// DDIM sampler over a continuous-time schedule
#[derive(Debug, Clone, Default)]
pub struct DdimSampler {
    config: DdimConfig,
}

impl DdimSampler {
    /// Creates a sampler from its configuration
    pub fn new(config: DdimConfig) -> Self {
        Self { config }
    }

    /// Amount of fresh noise per step
    pub fn eta(&self) -> f32 {
        self.config.eta
    }

    /// Takes one step from `t` to `t_next` given a velocity prediction
    ///
    /// Returns `(x_next, pred)` where `pred` is the clean-image estimate at `t`.
    pub fn step_with_velocity<B: Backend>(
        &self,
        key: RandomKey,
        x: Tensor<B, 4>,
        v: Tensor<B, 4>,
        t: f32,
        t_next: f32,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let (alpha, sigma) = t_to_alpha_sigma(t);
        let pred = x.clone() * alpha - v.clone() * sigma;
        let eps = x.clone() * sigma + v * alpha;

        let (alpha_next, sigma_next) = t_to_alpha_sigma(t_next);
        let (ddim_sigma, adjusted_sigma) =
            self.noise_split(alpha, sigma, alpha_next, sigma_next);

        let mut x_next = pred.clone() * alpha_next + eps * adjusted_sigma;
        if ddim_sigma > 0.0 {
            let noise = key.normal(x.dims(), &x.device());
            x_next = x_next + noise * ddim_sigma;
        }

        (x_next, pred)
    }

    /// Splits the next noise level into fresh noise and re-used `eps`
    fn noise_split(&self, alpha: f32, sigma: f32, alpha_next: f32, sigma_next: f32) -> (f32, f32) {
        let ddim_sigma = self.config.eta
            * (sigma_next.powi(2) / sigma.powi(2)).sqrt()
            * (1.0 - alpha.powi(2) / alpha_next.powi(2)).max(0.0).sqrt();
        let adjusted_sigma = (sigma_next.powi(2) - ddim_sigma.powi(2)).max(0.0).sqrt();
        (ddim_sigma, adjusted_sigma)
    }

    /// Unconditioned step
    pub fn step<B: Backend, D: Denoiser<B> + ?Sized>(
        &self,
        model: &D,
        key: RandomKey,
        x: Tensor<B, 4>,
        t: f32,
        t_next: f32,
        args: &DenoiserArgs,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let v = velocity(model, x.clone(), t, args);
        self.step_with_velocity(key, x, v, t, t_next)
    }

    /// Step with the velocity adjusted by a conditioning gradient
    ///
    /// The key is split into a noise key for the step and a key handed to
    /// `cond`. The model's velocity is detached before the gradient is
    /// folded in.
    #[allow(clippy::too_many_arguments)]
    pub fn cond_step<B: Backend, D: Denoiser<B> + ?Sized>(
        &self,
        model: &D,
        cond: &dyn CondFn<B>,
        key: RandomKey,
        x: Tensor<B, 4>,
        t: f32,
        t_next: f32,
        args: &DenoiserArgs,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let (noise_key, cond_key) = key.split();
        let v = velocity(model, x.clone(), t, args).detach();
        let grad = cond.gradient(x.clone(), cond_key, t, args);

        let (alpha, sigma) = t_to_alpha_sigma(t);
        let v = v - grad * (sigma / alpha);

        self.step_with_velocity(noise_key, x, v, t, t_next)
    }

    /// Runs the whole schedule and returns the final clean-image estimate
    ///
    /// `steps` must be strictly decreasing. The last step uses `t_next = t`,
    /// so no noise is added and its `pred` is the result. `interrupt` is
    /// polled before every step; when set, sampling stops with
    /// [`SampleError::Interrupted`].
    ///
    /// # Arguments
    ///
    /// * `model` - Velocity-predicting denoiser
    /// * `cond` - Optional conditioning; `None` samples unguided
    /// * `key` - Split once per step
    /// * `x` - Starting latent at `steps[0]`
    /// * `steps` - Schedule of times, first to last
    /// * `args` - Extra denoiser arguments
    /// * `interrupt` - Stop flag
    /// * `on_step` - Progress callback
    #[allow(clippy::too_many_arguments)]
    pub fn sample_loop<B, D, F>(
        &self,
        model: &D,
        cond: Option<&dyn CondFn<B>>,
        key: RandomKey,
        x: Tensor<B, 4>,
        steps: &[f32],
        args: &DenoiserArgs,
        interrupt: Option<&AtomicBool>,
        mut on_step: F,
    ) -> Result<Tensor<B, 4>, SampleError>
    where
        B: Backend,
        D: Denoiser<B> + ?Sized,
        F: FnMut(StepInfo),
    {
        if steps.is_empty() {
            return Err(SampleError::EmptySchedule);
        }

        let total_steps = steps.len();
        let mut key = key;
        let mut x = x;

        for (i, &t) in steps.iter().enumerate() {
            if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(SampleError::Interrupted);
            }

            let (next_key, step_key) = key.split();
            key = next_key;
            let t_next = steps.get(i + 1).copied().unwrap_or(t);

            let (x_next, pred) = match cond {
                Some(cond) => self.cond_step(model, cond, step_key, x, t, t_next, args),
                None => self.step(model, step_key, x, t, t_next, args),
            };

            tracing::trace!(step = i, t, t_next, "ddim step");
            on_step(StepInfo {
                step: i,
                total_steps,
                t,
            });

            if i + 1 == total_steps {
                return Ok(pred);
            }
            x = x_next;
        }

        unreachable!("non-empty schedule returns from its last step")
    }
}

/// Model velocity at a single time shared by the whole batch
fn velocity<B: Backend, D: Denoiser<B> + ?Sized>(
    model: &D,
    x: Tensor<B, 4>,
    t: f32,
    args: &DenoiserArgs,
) -> Tensor<B, 4> {
    let [batch, _, _, _] = x.dims();
    let t = Tensor::full([batch], t, &x.device());
    model.forward(RandomKey::dummy(), x, t, args)
}
