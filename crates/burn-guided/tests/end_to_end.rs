//! Full runs on the Gaussian denoiser with a tiny differentiable embedder

use std::sync::atomic::{AtomicBool, Ordering};

use burn::prelude::*;
use burn_autodiff::Autodiff;
use burn_guided::clip::{EmbedError, EmbeddingModel, ImageNormalization};
use burn_guided::samplers::GaussianDenoiser;
use burn_guided::{
    DriverReport, GuidedSampleConfig, GuidedSampler, PromptSpec, RandomKey, TargetSet,
    collect_targets, run_batches,
};
use burn_ndarray::NdArray;

type AD = Autodiff<NdArray<f32>>;

const DIM: usize = 6;

/// Text: byte histogram over six buckets. Images: per-channel mean and
/// spread, so gradients reach every pixel.
struct TinyEmbedder;

impl<B: Backend> EmbeddingModel<B> for TinyEmbedder {
    fn input_resolution(&self) -> usize {
        16
    }

    fn patch_size(&self) -> usize {
        4
    }

    fn normalization(&self) -> ImageNormalization {
        ImageNormalization::CLIP
    }

    fn tokenize(&self, text: &str, device: &B::Device) -> Result<Tensor<B, 2, Int>, EmbedError> {
        let mut counts = vec![0i64; DIM];
        for byte in text.bytes() {
            counts[byte as usize % DIM] += 1;
        }
        Ok(Tensor::from_data(TensorData::new(counts, [1, DIM]), device))
    }

    fn encode_text(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        tokens.float() - 1.0
    }

    fn encode_image(&self, pixels: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, h, w] = pixels.dims();
        let flat = pixels.reshape([batch, channels, h * w]);
        let mean = flat.clone().mean_dim(2).reshape([batch, channels]);
        let spread = flat.powi_scalar(2).mean_dim(2).reshape([batch, channels]);
        Tensor::cat(vec![mean, spread], 1)
    }
}

fn config(dir: &std::path::Path) -> GuidedSampleConfig {
    GuidedSampleConfig::default()
        .with_steps(50)
        .with_guidance_scale(100.0)
        .with_output_dir(dir)
}

fn run(
    model: &GaussianDenoiser<AD>,
    targets: &TargetSet<AD>,
    config: GuidedSampleConfig,
    seed: u64,
) -> DriverReport {
    let device = Default::default();
    let sampler = GuidedSampler::new(model, &TinyEmbedder, targets, config, &device);
    run_batches(&sampler, RandomKey::new(seed), &AtomicBool::new(false), |_| {}).unwrap()
}

#[test]
fn single_prompt_writes_one_image() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 16, 16], &device);
    let prompts = PromptSpec::parse("a lighthouse").unwrap();
    let targets = collect_targets(&TinyEmbedder, &prompts, &PromptSpec::default(), &device).unwrap();

    let report = run(&model, &targets, config(dir.path()), 0);
    assert!(!report.interrupted);
    assert_eq!(report.saved, vec![dir.path().join("out_00000.png")]);

    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);

    let image = image::open(dir.path().join("out_00000.png")).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (16, 16));
    let first = image.get_pixel(0, 0);
    assert!(image.pixels().any(|p| p != first), "degenerate output");
}

#[test]
fn fixed_seed_is_reproducible() {
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 8, 8], &device);
    let targets = TargetSet::new();

    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let c = tempfile::tempdir().unwrap();
    run(&model, &targets, config(a.path()).with_steps(20), 42);
    run(&model, &targets, config(b.path()).with_steps(20), 42);
    run(&model, &targets, config(c.path()).with_steps(20), 43);

    let read = |dir: &tempfile::TempDir| std::fs::read(dir.path().join("out_00000.png")).unwrap();
    assert_eq!(read(&a), read(&b));
    assert_ne!(read(&a), read(&c));
}

#[test]
fn batches_cover_requested_count() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 8, 8], &device);
    let targets = TargetSet::new();

    let config = config(dir.path()).with_steps(5).with_n(5).with_batch_size(2);
    let report = run(&model, &targets, config, 1);

    let expected: Vec<_> = (0..5)
        .map(|i| dir.path().join(format!("out_{i:05}.png")))
        .collect();
    assert_eq!(report.saved, expected);
    assert!(expected.iter().all(|p| p.exists()));
}

#[test]
fn guidance_moves_samples_toward_target() {
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 8, 8], &device);

    // a target with a bright mean in every channel
    let bright = TargetSet {
        text: vec![burn_guided::TargetEmbedding {
            embedding: Tensor::from_floats([1.0, 1.0, 1.0, 0.1, 0.1, 0.1], &device),
            weight: 1.0,
            source: "bright".to_string(),
        }],
        image: Vec::new(),
    };
    let config = GuidedSampleConfig::default().with_steps(30).with_eta(0.0);

    let mean = |targets: &TargetSet<AD>, scale: f32| -> f32 {
        let sampler = GuidedSampler::new(
            &model,
            &TinyEmbedder,
            targets,
            config.clone().with_guidance_scale(scale),
            &device,
        );
        sampler
            .sample_batch(RandomKey::new(9), 2, None, |_| {})
            .unwrap()
            .mean()
            .into_scalar()
    };

    let unguided = mean(&TargetSet::new(), 0.0);
    let guided = mean(&bright, 50.0);
    assert!(guided > unguided, "guided {guided} <= unguided {unguided}");
}

#[test]
fn init_image_run_writes_images() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 8, 8], &device);
    let targets = TargetSet::new();

    let init = Tensor::<AD, 4>::full([1, 3, 8, 8], 0.5, &device);
    let sampler = GuidedSampler::new(
        &model,
        &TinyEmbedder,
        &targets,
        config(dir.path()).with_steps(40).with_starting_timestep(0.3),
        &device,
    )
    .with_init_image(init)
    .unwrap();

    let schedule = sampler.schedule().unwrap();
    assert!(schedule.iter().all(|&t| t < 0.3));

    let mut steps_seen = 0;
    let report = run_batches(&sampler, RandomKey::new(0), &AtomicBool::new(false), |p| {
        steps_seen = p.step.step + 1;
        assert_eq!(p.step.total_steps, schedule.len());
    })
    .unwrap();
    assert_eq!(steps_seen, schedule.len());
    assert_eq!(report.saved.len(), 1);
}

#[test]
fn interrupt_stops_before_next_batch() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 8, 8], &device);
    let targets = TargetSet::new();
    let sampler = GuidedSampler::new(
        &model,
        &TinyEmbedder,
        &targets,
        config(dir.path()).with_steps(5).with_n(3),
        &device,
    );

    // trip the flag at the end of the first batch
    let interrupt = AtomicBool::new(false);
    let report = run_batches(&sampler, RandomKey::new(0), &interrupt, |p| {
        if p.batch == 0 && p.step.step + 1 == p.step.total_steps {
            interrupt.store(true, Ordering::Relaxed);
        }
    })
    .unwrap();

    assert!(report.interrupted);
    assert_eq!(report.saved, vec![dir.path().join("out_00000.png")]);
}

#[test]
fn interrupt_mid_batch_saves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = GaussianDenoiser::<AD>::standard([3, 8, 8], &device);
    let targets = TargetSet::new();
    let sampler = GuidedSampler::new(
        &model,
        &TinyEmbedder,
        &targets,
        config(dir.path()).with_steps(10),
        &device,
    );

    let interrupt = AtomicBool::new(false);
    let report = run_batches(&sampler, RandomKey::new(0), &interrupt, |p| {
        if p.step.step == 2 {
            interrupt.store(true, Ordering::Relaxed);
        }
    })
    .unwrap();

    assert!(report.interrupted);
    assert!(report.saved.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
