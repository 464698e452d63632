//! Samplers for v-objective diffusion models
//!
//! Time runs from `t = 1` (pure noise) down to `t = 0` (clean data), with
//! `alpha = cos(t * pi / 2)` and `sigma = sin(t * pi / 2)`.

pub mod ddim;
pub mod model;
pub mod schedule;

pub use ddim::{CondFn, DdimConfig, DdimSampler, SampleError, StepInfo};
pub use model::{Denoiser, DenoiserArgs, GaussianDenoiser};
pub use schedule::{
    alpha_sigma_to_t, ddpm_schedule, ddpm_t_to_t, linear_timesteps, t_to_alpha_sigma,
    truncate_below,
};
