//! Timestep schedules for v-objective diffusion
//!
//! Models are trained on a continuous time `t` in `[0, 1]` where the noise
//! level follows `alpha = cos(t * pi / 2)`, `sigma = sin(t * pi / 2)`.
//! Sampling walks a strictly decreasing list of such times.

use std::f64::consts::{FRAC_PI_2, PI};

/// Signal and noise scales at time `t`
pub fn t_to_alpha_sigma(t: f32) -> (f32, f32) {
    let angle = t as f64 * FRAC_PI_2;
    (angle.cos() as f32, angle.sin() as f32)
}

/// Inverse of [`t_to_alpha_sigma`]
pub fn alpha_sigma_to_t(alpha: f32, sigma: f32) -> f32 {
    ((sigma as f64).atan2(alpha as f64) / PI * 2.0) as f32
}

/// Maps a point on the discrete-time DDPM noise curve to continuous time
///
/// Uses `log_snr = -ln(expm1(1e-4 + 10 t^2))` and returns the time with the
/// same signal-to-noise ratio.
pub fn ddpm_t_to_t(ddpm_t: f32) -> f32 {
    let t = ddpm_t as f64;
    let log_snr = -(1e-4 + 10.0 * t * t).exp_m1().ln();
    let alpha = sigmoid(log_snr).sqrt();
    let sigma = sigmoid(-log_snr).sqrt();
    (sigma.atan2(alpha) / PI * 2.0) as f32
}

/// Applies [`ddpm_t_to_t`] to every time in `ts`
pub fn ddpm_schedule(ts: &[f32]) -> Vec<f32> {
    ts.iter().copied().map(ddpm_t_to_t).collect()
}

/// `steps` evenly spaced times from 1 down to (but excluding) 0
pub fn linear_timesteps(steps: usize) -> Vec<f32> {
    (0..steps)
        .map(|i| (1.0 - i as f64 / steps as f64) as f32)
        .collect()
}

/// Keeps only the times strictly below `start`
///
/// Used when sampling starts from a partially noised init image.
pub fn truncate_below(schedule: &[f32], start: f32) -> Vec<f32> {
    schedule.iter().copied().filter(|&t| t < start).collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
