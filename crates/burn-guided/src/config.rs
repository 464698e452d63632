//! Run configuration

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Number of steps must be positive")]
    ZeroSteps,

    #[error("Batch size must be positive")]
    ZeroBatchSize,

    #[error("Eta must be finite and non-negative, got {0}")]
    InvalidEta(f32),

    #[error("Guidance scale must be finite, got {0}")]
    InvalidGuidanceScale(f32),

    #[error("Starting timestep must be in (0, 1], got {0}")]
    InvalidStartingTimestep(f32),

    #[error("Init image has shape {actual:?}, model samples {expected:?}")]
    InitShape {
        expected: [usize; 3],
        actual: [usize; 4],
    },
}

/// Parameters of a guided sampling run
#[derive(Debug, Clone, PartialEq)]
pub struct GuidedSampleConfig {
    /// Timesteps in the full schedule
    pub steps: usize,
    /// DDIM noise amount, 0 for deterministic sampling
    pub eta: f32,
    /// Multiplier on the guidance gradient
    pub guidance_scale: f32,
    /// Where an init image enters the schedule
    pub starting_timestep: f32,
    /// Images sampled together
    pub batch_size: usize,
    /// Total number of images
    pub n: usize,
    /// Seed of the run key
    pub seed: u64,
    /// Directory receiving `out_NNNNN.png`
    pub output_dir: PathBuf,
}

impl Default for GuidedSampleConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            eta: 1.0,
            guidance_scale: 1000.0,
            starting_timestep: 0.9,
            batch_size: 1,
            n: 1,
            seed: 0,
            output_dir: PathBuf::from("."),
        }
    }
}

impl GuidedSampleConfig {
    /// Sets the number of timesteps
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the DDIM noise amount
    pub fn with_eta(mut self, eta: f32) -> Self {
        self.eta = eta;
        self
    }

    /// Sets the guidance strength
    pub fn with_guidance_scale(mut self, scale: f32) -> Self {
        self.guidance_scale = scale;
        self
    }

    /// Sets where an init image enters the schedule
    pub fn with_starting_timestep(mut self, t: f32) -> Self {
        self.starting_timestep = t;
        self
    }

    /// Sets the number of images per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the total number of images
    pub fn with_n(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Sets the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the output directory
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Checks every field against its allowed range
    ///
    /// # Errors
    ///
    /// The first [`ConfigError`] found: zero steps or batch size, a negative
    /// or non-finite eta, a non-finite guidance scale, or a starting
    /// timestep outside `(0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps == 0 {
            return Err(ConfigError::ZeroSteps);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !self.eta.is_finite() || self.eta < 0.0 {
            return Err(ConfigError::InvalidEta(self.eta));
        }
        if !self.guidance_scale.is_finite() {
            return Err(ConfigError::InvalidGuidanceScale(self.guidance_scale));
        }
        if !(self.starting_timestep > 0.0 && self.starting_timestep <= 1.0) {
            return Err(ConfigError::InvalidStartingTimestep(self.starting_timestep));
        }
        Ok(())
    }
}
