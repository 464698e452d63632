//! Splits a run into batches and saves every image

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use burn::tensor::backend::AutodiffBackend;
use burn_guided_clip::EmbeddingModel;
use burn_guided_core::{ImageIoError, RandomKey, save_images, tensor_to_images};
use burn_guided_samplers::{Denoiser, SampleError, StepInfo};
use thiserror::Error;

use crate::config::ConfigError;
use crate::sampling::GuidedSampler;

/// Errors that end a run before every image is saved
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sampling error: {0}")]
    Sample(#[from] SampleError),

    #[error("Image error: {0}")]
    Image(#[from] ImageIoError),
}

/// Progress of the whole run, reported after every sampler step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProgress {
    /// Zero-based batch index
    pub batch: usize,
    /// Number of batches in the run
    pub num_batches: usize,
    /// Index of the first image of this batch
    pub first_index: usize,
    /// Progress within the current batch
    pub step: StepInfo,
}

/// What a run left on disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverReport {
    /// Saved files in image-index order
    pub saved: Vec<PathBuf>,
    /// Whether the run stopped on the interrupt flag
    pub interrupted: bool,
}

/// Sizes of consecutive batches producing `total` images
///
/// Every batch holds `batch_size` images except possibly the last.
///
/// # Panics
///
/// If `batch_size` is zero. [`run_batches`] rejects such configs before
/// calling this.
pub fn batch_sizes(total: usize, batch_size: usize) -> Vec<usize> {
    assert!(batch_size > 0, "batch size must be positive");
    let mut sizes = Vec::with_capacity(total.div_ceil(batch_size));
    let mut remaining = total;
    while remaining > 0 {
        let n = remaining.min(batch_size);
        sizes.push(n);
        remaining -= n;
    }
    sizes
}

/// Samples `config.n` images in batches and writes them to `config.output_dir`
///
/// Each batch runs on a key split off the run key. When `interrupt` is set,
/// the in-flight batch is abandoned and the report lists what was already
/// saved.
///
/// # Arguments
///
/// * `sampler` - Guided sampler holding the run config
/// * `key` - Run key, split once per batch
/// * `interrupt` - Checked before each batch and after each step
/// * `on_progress` - Called after every sampler step
///
/// # Errors
///
/// [`DriverError::Config`] if the sampler's config fails
/// [`GuidedSampleConfig::validate`](crate::GuidedSampleConfig::validate),
/// before anything is sampled.
pub fn run_batches<B, D, E, F>(
    sampler: &GuidedSampler<'_, B, D, E>,
    key: RandomKey,
    interrupt: &AtomicBool,
    mut on_progress: F,
) -> Result<DriverReport, DriverError>
where
    B: AutodiffBackend,
    D: Denoiser<B> + ?Sized,
    E: EmbeddingModel<B> + ?Sized,
    F: FnMut(BatchProgress),
{
    let config = sampler.config();
    config.validate()?;
    let sizes = batch_sizes(config.n, config.batch_size);
    let num_batches = sizes.len();
    let output_dir: &Path = &config.output_dir;

    let mut report = DriverReport::default();
    let mut key = key;
    let mut first_index = 0;

    for (batch, n) in sizes.into_iter().enumerate() {
        if interrupt.load(Ordering::Relaxed) {
            report.interrupted = true;
            break;
        }

        let (next_key, batch_key) = key.split();
        key = next_key;

        tracing::info!(batch, num_batches, n, "starting batch");
        let result = sampler.sample_batch(batch_key, n, Some(interrupt), |step| {
            on_progress(BatchProgress {
                batch,
                num_batches,
                first_index,
                step,
            })
        });

        let samples = match result {
            Ok(samples) => samples,
            Err(SampleError::Interrupted) => {
                report.interrupted = true;
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let images = tensor_to_images(samples)?;
        let paths = save_images(&images, first_index, output_dir)?;
        for path in &paths {
            tracing::info!(path = %path.display(), "saved");
        }
        report.saved.extend(paths);
        first_index += n;
    }

    if report.interrupted {
        tracing::warn!(saved = report.saved.len(), "interrupted");
    }
    Ok(report)
}
