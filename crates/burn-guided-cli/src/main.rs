//! burn-guided CLI
//!
//! Samples images from a diffusion model steered toward text prompts and
//! reference images by CLIP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use burn::prelude::Backend;
use burn_guided::backends::{DefaultBackend, backend_name, default_device};
use burn_guided::clip::{ClipConfig, ClipEmbedder, ClipTokenizer};
use burn_guided::convert::load_clip;
use burn_guided::core::{image_to_tensor, load_rgb_resized};
use burn_guided::{
    BatchProgress, DenoiserRegistry, GuidedSampleConfig, GuidedSampler, PromptSpec, RandomKey,
    collect_targets, resolve_checkpoint, run_batches,
};
use clap::Parser;
use clap::builder::PossibleValuesParser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

type B = DefaultBackend;

fn model_names() -> PossibleValuesParser {
    PossibleValuesParser::new(DenoiserRegistry::<B>::with_builtin().names())
}

#[derive(Parser)]
#[command(name = "burn-guided")]
#[command(about = "CLIP-guided diffusion sampling in pure Rust")]
#[command(version)]
struct Cli {
    /// Text prompts, `|`-separated, each with an optional `:weight`
    #[arg(default_value = "")]
    prompt: String,

    /// Number of images per batch
    #[arg(long, visible_alias = "bs", default_value_t = 1)]
    batch_size: usize,

    /// Denoiser checkpoint (default: checkpoints/<model>.safetensors if present)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Strength of the CLIP guidance
    #[arg(long, visible_alias = "cs", default_value_t = 1000.0)]
    clip_guidance_scale: f32,

    /// Fresh noise per step (0 = deterministic DDIM, 1 = ancestral)
    #[arg(long, default_value_t = 1.0)]
    eta: f32,

    /// Image to start sampling from
    #[arg(long)]
    init: Option<PathBuf>,

    /// Denoiser variant
    #[arg(long, default_value = "gaussian", value_parser = model_names())]
    model: String,

    /// Number of images to sample
    #[arg(short, default_value_t = 1)]
    n: usize,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Timestep at which an init image enters the schedule
    #[arg(long, visible_alias = "st", default_value_t = 0.9)]
    starting_timestep: f32,

    /// Number of timesteps
    #[arg(long, default_value_t = 1000)]
    steps: usize,

    /// Target images, `|`-separated paths, each with an optional `:weight`
    #[arg(long, default_value = "")]
    target_img: String,

    /// Multiplier for every target image weight
    #[arg(long, default_value_t = 1.0)]
    target_img_w: f32,

    /// CLIP ViT-B/16 weights (HuggingFace safetensors)
    #[arg(long, default_value = "checkpoints/clip-vit-base-patch16.safetensors")]
    clip_weights: PathBuf,

    /// CLIP BPE merges file
    #[arg(long, default_value = "checkpoints/bpe_simple_vocab_16e6.txt")]
    vocab: PathBuf,

    /// Directory for out_NNNNN.png files
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();
}

/// First Ctrl-C stops sampling cleanly, the second exits at once
fn install_interrupt_handler(flag: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;

    std::thread::spawn(move || {
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("interrupt received, stopping; press Ctrl-C again to exit now");
            flag.store(true, Ordering::SeqCst);

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        })
    });
    Ok(())
}

fn load_embedder(
    weights: &Path,
    vocab: &Path,
    device: &<B as Backend>::Device,
) -> Result<ClipEmbedder<B>> {
    let config = ClipConfig::vit_b16();
    let model = load_clip::<B, _>(weights, &config, device)
        .with_context(|| format!("failed to load CLIP weights from {}", weights.display()))?;
    let tokenizer = ClipTokenizer::from_file(vocab)
        .with_context(|| format!("failed to load CLIP vocabulary from {}", vocab.display()))?;
    Ok(ClipEmbedder::new(model, tokenizer, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = GuidedSampleConfig::default()
        .with_steps(cli.steps)
        .with_eta(cli.eta)
        .with_guidance_scale(cli.clip_guidance_scale)
        .with_starting_timestep(cli.starting_timestep)
        .with_batch_size(cli.batch_size)
        .with_n(cli.n)
        .with_seed(cli.seed)
        .with_output_dir(cli.output_dir.clone());
    config.validate().context("invalid sampling options")?;

    let text = PromptSpec::parse(&cli.prompt).context("failed to parse prompt")?;
    let images = PromptSpec::parse(&cli.target_img)
        .context("failed to parse target images")?
        .scale_weights(cli.target_img_w);
    if text.is_empty() && images.is_empty() {
        tracing::warn!("no prompts or target images, sampling without guidance");
    }

    let device = default_device();
    tracing::info!(backend = backend_name(), model = %cli.model, "starting");

    let interrupt = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(interrupt.clone())?;

    let registry = DenoiserRegistry::<B>::with_builtin();
    let checkpoint = resolve_checkpoint(Path::new("."), &cli.model, cli.checkpoint.as_deref());
    let denoiser = registry
        .load(&cli.model, checkpoint.as_deref(), &device)
        .with_context(|| format!("failed to load model {}", cli.model))?;

    let embedder = load_embedder(&cli.clip_weights, &cli.vocab, &device)?;
    let targets = collect_targets(&embedder, &text, &images, &device)
        .context("failed to embed targets")?;

    let mut sampler = GuidedSampler::new(denoiser.as_ref(), &embedder, &targets, config, &device);
    if let Some(path) = &cli.init {
        let [_, h, w] = denoiser.shape();
        let rgb = load_rgb_resized(path, w as u32, h as u32)
            .with_context(|| format!("failed to load init image {}", path.display()))?;
        sampler = sampler
            .with_init_image(image_to_tensor::<B>(&rgb, &device))
            .context("init image does not fit the model")?;
    }

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let on_progress = |p: BatchProgress| {
        let done = p.batch * p.step.total_steps + p.step.step + 1;
        let total = p.num_batches * p.step.total_steps;
        pb.set_position((done * 100 / total.max(1)) as u64);
        pb.set_message(format!(
            "batch {}/{} step {}/{} t={:.3}",
            p.batch + 1,
            p.num_batches,
            p.step.step + 1,
            p.step.total_steps,
            p.step.t
        ));
    };

    let report = run_batches(&sampler, RandomKey::new(cli.seed), &interrupt, on_progress)
        .context("sampling failed")?;
    pb.finish_and_clear();

    if report.interrupted {
        tracing::info!(saved = report.saved.len(), "stopped early");
    } else if report.saved.len() != cli.n {
        bail!("expected {} images, saved {}", cli.n, report.saved.len());
    } else {
        tracing::info!(saved = report.saved.len(), dir = %cli.output_dir.display(), "done");
    }
    Ok(())
}
