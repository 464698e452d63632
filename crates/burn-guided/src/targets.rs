//! Target embeddings guidance pulls samples toward

use std::path::Path;

use burn::prelude::*;
use burn_guided_clip::{EmbedError, EmbeddingModel};
use burn_guided_core::{ImageIoError, load_image};
use thiserror::Error;

use crate::prompt::PromptSpec;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("Image error: {0}")]
    Image(#[from] ImageIoError),

    #[error("Target {0:?} has a zero embedding")]
    ZeroEmbedding(String),
}

/// One embedded prompt or image with its weight
#[derive(Debug, Clone)]
pub struct TargetEmbedding<B: Backend> {
    /// `[dim]`, detached
    pub embedding: Tensor<B, 1>,
    /// Multiplier on this target's loss
    pub weight: f32,
    /// Prompt text or image path, for logs
    pub source: String,
}

/// Text targets followed by image targets
#[derive(Debug, Clone)]
pub struct TargetSet<B: Backend> {
    /// Embedded text prompts
    pub text: Vec<TargetEmbedding<B>>,
    /// Embedded reference images
    pub image: Vec<TargetEmbedding<B>>,
}

impl<B: Backend> Default for TargetSet<B> {
    fn default() -> Self {
        Self {
            text: Vec::new(),
            image: Vec::new(),
        }
    }
}

impl<B: Backend> TargetSet<B> {
    /// Creates an empty set; sampling with it is unguided
    pub fn new() -> Self {
        Self::default()
    }

    /// True if there are neither text nor image targets
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.image.is_empty()
    }

    /// Total number of text and image targets
    pub fn len(&self) -> usize {
        self.text.len() + self.image.len()
    }

    /// All targets, text first, in the order they were collected
    pub fn iter(&self) -> impl Iterator<Item = &TargetEmbedding<B>> {
        self.text.iter().chain(self.image.iter())
    }
}

/// Embeds one prompt as a `[dim]` vector
pub fn embed_text<B: Backend, E: EmbeddingModel<B> + ?Sized>(
    model: &E,
    text: &str,
    device: &B::Device,
) -> Result<Tensor<B, 1>, TargetError> {
    let tokens = model.tokenize(text, device)?;
    let embedding = model.encode_text(tokens);
    let [_, dim] = embedding.dims();
    Ok(embedding.reshape([dim]).detach())
}

/// Loads, preprocesses, and embeds one image as a `[dim]` vector
pub fn embed_image<B: Backend, E: EmbeddingModel<B> + ?Sized>(
    model: &E,
    path: &Path,
    device: &B::Device,
) -> Result<Tensor<B, 1>, TargetError> {
    let image = load_image(path)?;
    let pixels = model.preprocess(&image, device);
    let embedding = model.encode_image(pixels);
    let [_, dim] = embedding.dims();
    Ok(embedding.reshape([dim]).detach())
}

fn checked<B: Backend>(
    embedding: Tensor<B, 1>,
    weight: f32,
    source: &str,
) -> Result<TargetEmbedding<B>, TargetError> {
    let norm: f32 = embedding
        .clone()
        .powi_scalar(2)
        .sum()
        .into_scalar()
        .elem();
    if norm <= 0.0 || !norm.is_finite() {
        return Err(TargetError::ZeroEmbedding(source.to_string()));
    }
    tracing::info!(source, weight, "target embedded");
    Ok(TargetEmbedding {
        embedding,
        weight,
        source: source.to_string(),
    })
}

/// Embeds every text prompt and every image path of the two specs
///
/// Image prompt texts are file paths. Order within each list follows the
/// specs.
///
/// # Arguments
///
/// * `model` - Embedding model for both prompts and images
/// * `text` - Text prompts with weights
/// * `images` - Image paths with weights
/// * `device` - Device to place the embeddings on
///
/// # Errors
///
/// Stops at the first target that cannot be embedded. A zero embedding
/// counts as a failure, since its direction is undefined.
pub fn collect_targets<B: Backend, E: EmbeddingModel<B> + ?Sized>(
    model: &E,
    text: &PromptSpec,
    images: &PromptSpec,
    device: &B::Device,
) -> Result<TargetSet<B>, TargetError> {
    let mut targets = TargetSet::new();

    for prompt in text.iter() {
        let embedding = embed_text(model, &prompt.text, device)?;
        targets.text.push(checked(embedding, prompt.weight, &prompt.text)?);
    }

    for prompt in images.iter() {
        let embedding = embed_image(model, Path::new(&prompt.text), device)?;
        targets.image.push(checked(embedding, prompt.weight, &prompt.text)?);
    }

    tracing::debug!(
        text = targets.text.len(),
        image = targets.image.len(),
        "collected targets"
    );
    Ok(targets)
}
