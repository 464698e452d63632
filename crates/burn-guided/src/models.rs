//! Named denoiser variants
//!
//! The command line `--model` flag picks an entry from a
//! [`DenoiserRegistry`]. Each entry builds a boxed [`Denoiser`] from an
//! optional checkpoint.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn_guided_convert::{DenoiserLoadError, load_gaussian_denoiser};
use burn_guided_samplers::{Denoiser, GaussianDenoiser};
use thiserror::Error;

/// Image shape of the built-in `gaussian` variant
pub const GAUSSIAN_SHAPE: [usize; 3] = [3, 128, 128];

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unknown model {name:?}, available: {available}")]
    UnknownModel { name: String, available: String },

    #[error("Load error: {0}")]
    Load(#[from] DenoiserLoadError),
}

/// Builds a denoiser from an optional checkpoint
pub type DenoiserFactory<B> =
    fn(Option<&Path>, &<B as Backend>::Device) -> Result<Box<dyn Denoiser<B>>, ModelError>;

/// Ordered map from variant name to constructor
pub struct DenoiserRegistry<B: Backend> {
    entries: Vec<(&'static str, DenoiserFactory<B>)>,
}

impl<B: Backend> Default for DenoiserRegistry<B> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<B: Backend> DenoiserRegistry<B> {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every variant this crate ships
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("gaussian", load_gaussian::<B>);
        registry
    }

    /// Adds or replaces a variant
    pub fn register(&mut self, name: &'static str, factory: DenoiserFactory<B>) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((name, factory)),
        }
    }

    /// Variant names in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    /// True if `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| *n == name)
    }

    /// Builds the variant called `name`
    ///
    /// # Arguments
    ///
    /// * `name` - Registered variant name
    /// * `checkpoint` - Weights to load; `None` uses the variant's defaults
    /// * `device` - Device for the model's tensors
    pub fn load(
        &self,
        name: &str,
        checkpoint: Option<&Path>,
        device: &B::Device,
    ) -> Result<Box<dyn Denoiser<B>>, ModelError> {
        let (_, factory) = self
            .entries
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| ModelError::UnknownModel {
                name: name.to_string(),
                available: self.names().join(", "),
            })?;
        factory(checkpoint, device)
    }
}

/// `checkpoints/{name}.safetensors` under `root`
pub fn default_checkpoint(root: &Path, name: &str) -> PathBuf {
    root.join("checkpoints").join(format!("{name}.safetensors"))
}

/// The explicit checkpoint if given, else the default one if it exists
pub fn resolve_checkpoint(root: &Path, name: &str, explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let path = default_checkpoint(root, name);
            path.exists().then_some(path)
        }
    }
}

fn load_gaussian<B: Backend>(
    checkpoint: Option<&Path>,
    device: &B::Device,
) -> Result<Box<dyn Denoiser<B>>, ModelError> {
    match checkpoint {
        Some(path) => Ok(Box::new(load_gaussian_denoiser(path, GAUSSIAN_SHAPE, device)?)),
        None => {
            tracing::info!("no checkpoint, using built-in gaussian statistics");
            Ok(Box::new(GaussianDenoiser::standard(GAUSSIAN_SHAPE, device)))
        }
    }
}
