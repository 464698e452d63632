//! CLIP configuration, shared transformer blocks and the text tower

use burn::module::Param;
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

use crate::attention::{causal_mask, scaled_dot_product_attention};
use crate::layernorm::LayerNorm;

/// Text tower hyperparameters
#[derive(Debug, Clone)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub context_length: usize,
    pub intermediate_size: usize,
}

/// Vision tower hyperparameters
#[derive(Debug, Clone)]
pub struct ClipVisionConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
}

impl ClipVisionConfig {
    /// Patches per side
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Patch tokens plus the class token
    pub fn num_positions(&self) -> usize {
        self.grid_size() * self.grid_size() + 1
    }
}

/// Full CLIP model configuration
#[derive(Debug, Clone)]
pub struct ClipConfig {
    pub text: ClipTextConfig,
    pub vision: ClipVisionConfig,
    /// Size of the shared embedding space
    pub projection_dim: usize,
}

impl ClipConfig {
    /// OpenAI CLIP ViT-B/16
    pub fn vit_b16() -> Self {
        Self {
            text: ClipTextConfig {
                vocab_size: 49408,
                embed_dim: 512,
                num_heads: 8,
                num_layers: 12,
                context_length: 77,
                intermediate_size: 2048,
            },
            vision: ClipVisionConfig {
                image_size: 224,
                patch_size: 16,
                embed_dim: 768,
                num_heads: 12,
                num_layers: 12,
                intermediate_size: 3072,
            },
            projection_dim: 512,
        }
    }

    /// OpenAI CLIP ViT-B/32
    pub fn vit_b32() -> Self {
        let mut config = Self::vit_b16();
        config.vision.patch_size = 32;
        config
    }
}

/// CLIP text encoder
///
/// Causal transformer over token ids; the pooled output is the final hidden
/// state at the end-of-text token.
#[derive(Module, Debug)]
pub struct ClipTextEncoder<B: Backend> {
    pub token_embedding: Embedding<B>,
    pub position_embedding: Param<Tensor<B, 2>>,
    pub layers: Vec<TransformerBlock<B>>,
    pub final_layer_norm: LayerNorm<B>,
    pub context_length: usize,
}

impl<B: Backend> ClipTextEncoder<B> {
    /// Creates a zero-initialized text encoder
    ///
    /// # Arguments
    ///
    /// * `config` - Text tower dimensions
    /// * `device` - Device to create tensors on
    pub fn new(config: &ClipTextConfig, device: &B::Device) -> Self {
        Self {
            token_embedding: EmbeddingConfig::new(config.vocab_size, config.embed_dim).init(device),
            position_embedding: Param::from_tensor(Tensor::zeros(
                [config.context_length, config.embed_dim],
                device,
            )),
            layers: (0..config.num_layers)
                .map(|_| {
                    TransformerBlock::new(
                        config.embed_dim,
                        config.num_heads,
                        config.intermediate_size,
                        device,
                    )
                })
                .collect(),
            final_layer_norm: LayerNorm::new(config.embed_dim, device),
            context_length: config.context_length,
        }
    }

    /// `token_ids: [batch, seq]` to hidden states `[batch, seq, embed_dim]`
    pub fn forward(&self, token_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [_batch, seq_len] = token_ids.dims();

        let x = self.token_embedding.forward(token_ids);
        let pos = self.position_embedding.val().slice([0..seq_len]).unsqueeze::<3>();
        let mut x = x + pos;

        let mask = causal_mask(seq_len, &x.device());
        for layer in &self.layers {
            x = layer.forward(x, Some(mask.clone()));
        }

        self.final_layer_norm.forward(x)
    }

    /// Hidden state at each row's end-of-text token, `[batch, embed_dim]`
    ///
    /// The end marker has the highest id in the vocabulary, so its position
    /// is the row's argmax.
    pub fn forward_pooled(&self, token_ids: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let eot = token_ids.clone().argmax(1);
        let hidden = self.forward(token_ids);
        let [batch, _seq, embed] = hidden.dims();

        let index = eot.reshape([batch, 1, 1]).repeat_dim(2, embed);
        hidden.gather(1, index).reshape([batch, embed])
    }
}

/// Pre-norm transformer block
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    /// Norm before attention
    pub attn_norm: LayerNorm<B>,
    /// Self-attention
    pub attn: MultiHeadSelfAttention<B>,
    /// Norm before the MLP
    pub ffn_norm: LayerNorm<B>,
    /// Position-wise MLP
    pub ffn: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    /// Creates a new transformer block
    ///
    /// # Arguments
    ///
    /// * `embed_dim` - Width of the residual stream
    /// * `num_heads` - Number of attention heads
    /// * `intermediate_size` - Hidden width of the MLP
    /// * `device` - Device to create tensors on
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        intermediate_size: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            attn_norm: LayerNorm::new(embed_dim, device),
            attn: MultiHeadSelfAttention::new(embed_dim, num_heads, device),
            ffn_norm: LayerNorm::new(embed_dim, device),
            ffn: FeedForward::new(embed_dim, intermediate_size, device),
        }
    }

    /// Applies attention then the MLP, each with a residual connection
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn.forward(self.attn_norm.forward(x), mask);
        x.clone() + self.ffn.forward(self.ffn_norm.forward(x))
    }
}

/// Multi-head self-attention with separate q/k/v projections
#[derive(Module, Debug)]
pub struct MultiHeadSelfAttention<B: Backend> {
    pub q_proj: Linear<B>,
    pub k_proj: Linear<B>,
    pub v_proj: Linear<B>,
    pub out_proj: Linear<B>,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl<B: Backend> MultiHeadSelfAttention<B> {
    /// Creates attention over `embed_dim` split into `num_heads` heads
    pub fn new(embed_dim: usize, num_heads: usize, device: &B::Device) -> Self {
        Self {
            q_proj: LinearConfig::new(embed_dim, embed_dim).init(device),
            k_proj: LinearConfig::new(embed_dim, embed_dim).init(device),
            v_proj: LinearConfig::new(embed_dim, embed_dim).init(device),
            out_proj: LinearConfig::new(embed_dim, embed_dim).init(device),
            num_heads,
            head_dim: embed_dim / num_heads,
        }
    }

    /// `x: [batch, seq, embed_dim]`, `mask` added to the attention scores
    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let heads = |t: Tensor<B, 3>| {
            t.reshape([batch, seq_len, self.num_heads, self.head_dim])
                .swap_dims(1, 2)
        };

        let q = heads(self.q_proj.forward(x.clone()));
        let k = heads(self.k_proj.forward(x.clone()));
        let v = heads(self.v_proj.forward(x));

        let out = scaled_dot_product_attention(q, k, v, mask, self.head_dim)
            .swap_dims(1, 2)
            .reshape([batch, seq_len, self.num_heads * self.head_dim]);

        self.out_proj.forward(out)
    }
}

/// MLP with QuickGELU
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    /// Creates an MLP `embed_dim -> intermediate_size -> embed_dim`
    pub fn new(embed_dim: usize, intermediate_size: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(embed_dim, intermediate_size).init(device),
            fc2: LinearConfig::new(intermediate_size, embed_dim).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(quick_gelu(self.fc1.forward(x)))
    }
}

/// `x * sigmoid(1.702 * x)`
fn quick_gelu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x * 1.702)
}
