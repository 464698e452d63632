//! CLIP weights in HuggingFace `CLIPModel` layout
//!
//! Tensor names follow `transformers`:
//!
//! ```text
//! text_model.embeddings.{token,position}_embedding.weight
//! text_model.encoder.layers.{i}.{self_attn.{q,k,v,out}_proj,layer_norm{1,2},mlp.fc{1,2}}
//! text_model.final_layer_norm
//! vision_model.embeddings.{class_embedding,patch_embedding.weight,position_embedding.weight}
//! vision_model.{pre_layrnorm,post_layernorm}
//! vision_model.encoder.layers.{i}...
//! {text,visual}_projection.weight
//! ```
//!
//! A common root prefix (e.g. `clip.`) is detected and stripped.

use std::path::Path;

use burn::module::Param;
use burn::nn::conv::Conv2dConfig;
use burn::nn::{EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn_guided_clip::{
    ClipConfig, ClipModel, ClipTextEncoder, ClipVisionEncoder, FeedForward, LayerNorm,
    MultiHeadSelfAttention, TransformerBlock,
};
use thiserror::Error;

use crate::loader::{LoadError, SafeTensorFile};

#[derive(Debug, Error)]
pub enum ClipLoadError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("No CLIP text model found in checkpoint")]
    NotClip,

    #[error("Shape mismatch for {tensor}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

const TEXT_MARKER: &str = "text_model.embeddings.token_embedding.weight";

/// Loads both CLIP towers and projections from a safetensors checkpoint
///
/// Accepts HuggingFace `CLIPModel` checkpoints, with or without a leading
/// module prefix. Linear weights are transposed to Burn's layout.
///
/// # Arguments
///
/// * `path` - Checkpoint file
/// * `config` - Dimensions the checkpoint must match
/// * `device` - Device to load tensors onto
pub fn load_clip<B: Backend, P: AsRef<Path>>(
    path: P,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipModel<B>, ClipLoadError> {
    let path = path.as_ref();
    let file = SafeTensorFile::open(path)?;
    let root = detect_root(&file).ok_or(ClipLoadError::NotClip)?;
    tracing::info!(path = %path.display(), root = %root, "loading CLIP weights");

    let text = load_text(&file, &format!("{root}text_model"), config, device)?;
    let vision = load_vision(&file, &format!("{root}vision_model"), config, device)?;

    let text_projection = load_linear(
        &file,
        &format!("{root}text_projection"),
        config.text.embed_dim,
        config.projection_dim,
        device,
    )?;
    let visual_projection = load_linear(
        &file,
        &format!("{root}visual_projection"),
        config.vision.embed_dim,
        config.projection_dim,
        device,
    )?;

    Ok(ClipModel {
        text,
        vision,
        text_projection,
        visual_projection,
    })
}

fn detect_root(file: &SafeTensorFile) -> Option<String> {
    file.names()
        .find_map(|name| name.strip_suffix(TEXT_MARKER))
        .map(str::to_string)
}

fn load_text<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipTextEncoder<B>, ClipLoadError> {
    let text = &config.text;

    let mut token_embedding = EmbeddingConfig::new(text.vocab_size, text.embed_dim).init(device);
    token_embedding.weight = Param::from_tensor(file.load_f32_checked(
        &format!("{prefix}.embeddings.token_embedding.weight"),
        [text.vocab_size, text.embed_dim],
        device,
    )?);

    let position_embedding = Param::from_tensor(file.load_f32_checked(
        &format!("{prefix}.embeddings.position_embedding.weight"),
        [text.context_length, text.embed_dim],
        device,
    )?);

    let layers = (0..text.num_layers)
        .map(|i| {
            load_block(
                file,
                &format!("{prefix}.encoder.layers.{i}"),
                text.embed_dim,
                text.num_heads,
                text.intermediate_size,
                device,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClipTextEncoder {
        token_embedding,
        position_embedding,
        layers,
        final_layer_norm: load_layer_norm(file, &format!("{prefix}.final_layer_norm"), device)?,
        context_length: text.context_length,
    })
}

fn load_vision<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    config: &ClipConfig,
    device: &B::Device,
) -> Result<ClipVisionEncoder<B>, ClipLoadError> {
    let vision = &config.vision;
    let width = vision.embed_dim;
    let patch = vision.patch_size;

    let mut patch_embedding = Conv2dConfig::new([3, width], [patch, patch])
        .with_stride([patch, patch])
        .with_bias(false)
        .init(device);
    patch_embedding.weight = Param::from_tensor(file.load_f32_checked(
        &format!("{prefix}.embeddings.patch_embedding.weight"),
        [width, 3, patch, patch],
        device,
    )?);

    let class_embedding = Param::from_tensor(file.load_f32_checked(
        &format!("{prefix}.embeddings.class_embedding"),
        [width],
        device,
    )?);
    let position_embedding = Param::from_tensor(file.load_f32_checked(
        &format!("{prefix}.embeddings.position_embedding.weight"),
        [vision.num_positions(), width],
        device,
    )?);

    let layers = (0..vision.num_layers)
        .map(|i| {
            load_block(
                file,
                &format!("{prefix}.encoder.layers.{i}"),
                width,
                vision.num_heads,
                vision.intermediate_size,
                device,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClipVisionEncoder {
        patch_embedding,
        class_embedding,
        position_embedding,
        // the upstream checkpoint spells it "pre_layrnorm"
        pre_layernorm: load_layer_norm(file, &format!("{prefix}.pre_layrnorm"), device)?,
        layers,
        post_layernorm: load_layer_norm(file, &format!("{prefix}.post_layernorm"), device)?,
        image_size: vision.image_size,
    })
}

fn load_block<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    embed_dim: usize,
    num_heads: usize,
    intermediate_size: usize,
    device: &B::Device,
) -> Result<TransformerBlock<B>, ClipLoadError> {
    let proj = |name: &str| {
        load_linear(
            file,
            &format!("{prefix}.self_attn.{name}"),
            embed_dim,
            embed_dim,
            device,
        )
    };

    let attn = MultiHeadSelfAttention {
        q_proj: proj("q_proj")?,
        k_proj: proj("k_proj")?,
        v_proj: proj("v_proj")?,
        out_proj: proj("out_proj")?,
        num_heads,
        head_dim: embed_dim / num_heads,
    };

    let ffn = FeedForward {
        fc1: load_linear(
            file,
            &format!("{prefix}.mlp.fc1"),
            embed_dim,
            intermediate_size,
            device,
        )?,
        fc2: load_linear(
            file,
            &format!("{prefix}.mlp.fc2"),
            intermediate_size,
            embed_dim,
            device,
        )?,
    };

    Ok(TransformerBlock {
        attn_norm: load_layer_norm(file, &format!("{prefix}.layer_norm1"), device)?,
        attn,
        ffn_norm: load_layer_norm(file, &format!("{prefix}.layer_norm2"), device)?,
        ffn,
    })
}

/// Loads `{prefix}.weight` (and `{prefix}.bias` when present)
///
/// PyTorch stores `[out, in]`; burn's `Linear` wants `[in, out]`.
fn load_linear<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    in_features: usize,
    out_features: usize,
    device: &B::Device,
) -> Result<Linear<B>, ClipLoadError> {
    let weight_key = format!("{prefix}.weight");
    let weight: Tensor<B, 2> = file.load_f32(&weight_key, device)?;

    let [out_f, in_f] = weight.dims();
    if out_f != out_features || in_f != in_features {
        return Err(ClipLoadError::ShapeMismatch {
            tensor: weight_key,
            expected: vec![out_features, in_features],
            actual: vec![out_f, in_f],
        });
    }

    let bias_key = format!("{prefix}.bias");
    let has_bias = file.contains(&bias_key);
    let mut linear = LinearConfig::new(in_features, out_features)
        .with_bias(has_bias)
        .init(device);
    linear.weight = Param::from_tensor(weight.transpose());
    if has_bias {
        linear.bias = Some(Param::from_tensor(file.load_f32_checked(
            &bias_key,
            [out_features],
            device,
        )?));
    }

    Ok(linear)
}

fn load_layer_norm<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    device: &B::Device,
) -> Result<LayerNorm<B>, ClipLoadError> {
    let weight = file.load_f32(&format!("{prefix}.weight"), device)?;
    let bias = file.load_f32(&format!("{prefix}.bias"), device)?;
    Ok(LayerNorm::from_weight_bias(weight, bias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::save_f32;
    use burn_guided_clip::{ClipTextConfig, ClipVisionConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> ClipConfig {
        ClipConfig {
            text: ClipTextConfig {
                vocab_size: 10,
                embed_dim: 4,
                num_heads: 2,
                num_layers: 1,
                context_length: 5,
                intermediate_size: 8,
            },
            vision: ClipVisionConfig {
                image_size: 4,
                patch_size: 2,
                embed_dim: 6,
                num_heads: 2,
                num_layers: 1,
                intermediate_size: 12,
            },
            projection_dim: 3,
        }
    }

    fn block_tensors(prefix: &str, dim: usize, hidden: usize) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            out.push((format!("{prefix}.self_attn.{proj}.weight"), vec![dim, dim]));
            out.push((format!("{prefix}.self_attn.{proj}.bias"), vec![dim]));
        }
        for norm in ["layer_norm1", "layer_norm2"] {
            out.push((format!("{prefix}.{norm}.weight"), vec![dim]));
            out.push((format!("{prefix}.{norm}.bias"), vec![dim]));
        }
        out.push((format!("{prefix}.mlp.fc1.weight"), vec![hidden, dim]));
        out.push((format!("{prefix}.mlp.fc1.bias"), vec![hidden]));
        out.push((format!("{prefix}.mlp.fc2.weight"), vec![dim, hidden]));
        out.push((format!("{prefix}.mlp.fc2.bias"), vec![dim]));
        out
    }

    fn checkpoint_tensors(root: &str, config: &ClipConfig) -> Vec<(String, Vec<usize>)> {
        let t = &config.text;
        let v = &config.vision;
        let mut names = vec![
            (format!("{root}text_model.embeddings.token_embedding.weight"), vec![t.vocab_size, t.embed_dim]),
            (format!("{root}text_model.embeddings.position_embedding.weight"), vec![t.context_length, t.embed_dim]),
            (format!("{root}text_model.final_layer_norm.weight"), vec![t.embed_dim]),
            (format!("{root}text_model.final_layer_norm.bias"), vec![t.embed_dim]),
            (format!("{root}vision_model.embeddings.class_embedding"), vec![v.embed_dim]),
            (format!("{root}vision_model.embeddings.patch_embedding.weight"), vec![v.embed_dim, 3, v.patch_size, v.patch_size]),
            (format!("{root}vision_model.embeddings.position_embedding.weight"), vec![v.num_positions(), v.embed_dim]),
            (format!("{root}vision_model.pre_layrnorm.weight"), vec![v.embed_dim]),
            (format!("{root}vision_model.pre_layrnorm.bias"), vec![v.embed_dim]),
            (format!("{root}vision_model.post_layernorm.weight"), vec![v.embed_dim]),
            (format!("{root}vision_model.post_layernorm.bias"), vec![v.embed_dim]),
            (format!("{root}text_projection.weight"), vec![config.projection_dim, t.embed_dim]),
            (format!("{root}visual_projection.weight"), vec![config.projection_dim, v.embed_dim]),
        ];
        names.extend(block_tensors(&format!("{root}text_model.encoder.layers.0"), t.embed_dim, t.intermediate_size));
        names.extend(block_tensors(&format!("{root}vision_model.encoder.layers.0"), v.embed_dim, v.intermediate_size));
        names
    }

    fn write_checkpoint(path: &Path, root: &str, config: &ClipConfig) {
        let tensors: Vec<(String, Vec<usize>, Vec<f32>)> = checkpoint_tensors(root, config)
            .into_iter()
            .map(|(name, shape)| {
                let n: usize = shape.iter().product();
                let values = (0..n).map(|i| ((i % 7) as f32 - 3.0) * 0.05).collect();
                (name, shape, values)
            })
            .collect();
        let borrowed: Vec<(&str, Vec<usize>, Vec<f32>)> = tensors
            .iter()
            .map(|(n, s, v)| (n.as_str(), s.clone(), v.clone()))
            .collect();
        save_f32(path, &borrowed).unwrap();
    }

    #[test]
    fn test_load_prefixed_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.safetensors");
        let config = tiny_config();
        write_checkpoint(&path, "clip.", &config);

        let device = Default::default();
        let model: ClipModel<TestBackend> = load_clip(&path, &config, &device).unwrap();
        assert_eq!(model.text_projection.weight.dims(), [4, 3]);
        assert!(model.text_projection.bias.is_none());
        assert_eq!(model.vision.layers.len(), 1);

        let tokens = Tensor::<TestBackend, 2, Int>::from_ints([[8, 1, 9, 0, 0]], &device);
        assert_eq!(model.encode_text(tokens).dims(), [1, 3]);
        let pixels = Tensor::zeros([2, 3, 4, 4], &device);
        assert_eq!(model.encode_image(pixels).dims(), [2, 3]);
    }

    #[test]
    fn test_rejects_non_clip_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.safetensors");
        save_f32(&path, &[("mean", vec![3], vec![0.0; 3])]).unwrap();

        let device = Default::default();
        let err = load_clip::<TestBackend, _>(&path, &tiny_config(), &device).unwrap_err();
        assert!(matches!(err, ClipLoadError::NotClip));
    }

    #[test]
    fn test_wrong_config_reports_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.safetensors");
        write_checkpoint(&path, "", &tiny_config());

        let mut config = tiny_config();
        config.projection_dim = 5;
        let device = Default::default();
        let err = load_clip::<TestBackend, _>(&path, &config, &device).unwrap_err();
        assert!(matches!(err, ClipLoadError::ShapeMismatch { .. }));
    }
}
