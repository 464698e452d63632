//! CLIP text and image encoders
//!
//! Both towers of OpenAI CLIP, projected into the shared embedding space,
//! plus the BPE tokenizer and image preprocessing.
//!
//! # Example
//!
//! ```ignore
//! use burn_guided_clip::{ClipConfig, ClipEmbedder, ClipTokenizer, EmbeddingModel};
//!
//! let config = ClipConfig::vit_b16();
//! let model = burn_guided_convert::load_clip("clip-vit-b16.safetensors", &config, &device)?;
//! let tokenizer = ClipTokenizer::from_file("bpe_simple_vocab_16e6.txt")?;
//! let clip = ClipEmbedder::new(model, tokenizer, config);
//!
//! let tokens = clip.tokenize("a watercolor of a lighthouse", &device)?;
//! let embedding = clip.encode_text(tokens); // [1, 512]
//! ```

pub mod attention;
pub mod clip;
pub mod embedder;
pub mod layernorm;
pub mod model;
pub mod tokenizer;
pub mod vision;

pub use clip::{
    ClipConfig, ClipTextConfig, ClipTextEncoder, ClipVisionConfig, FeedForward,
    MultiHeadSelfAttention, TransformerBlock,
};
pub use embedder::{ClipEmbedder, EmbedError, EmbeddingModel, ImageNormalization, preprocess_image};
pub use layernorm::LayerNorm;
pub use model::ClipModel;
pub use tokenizer::{ClipTokenizer, END_OF_TEXT, START_OF_TEXT, TokenizerError};
pub use vision::ClipVisionEncoder;
