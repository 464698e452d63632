//! Attention helpers shared by the text and vision towers

use burn::prelude::*;

/// Additive causal mask: `0` on and below the diagonal, `-inf` above
#[rustfmt::skip]
pub fn causal_mask<B: Backend>(seq_len: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut mask = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_data(TensorData::new(mask, [seq_len, seq_len]), device)
}

/// Scaled dot-product attention over `[batch, heads, seq, head_dim]`
///
/// Softmax subtracts the row max first so half precision doesn't overflow.
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    mask: Option<Tensor<B, 2>>,
    head_dim: usize,
) -> Tensor<B, 4> {
    let scale = (head_dim as f64).powf(-0.5);
    let scores = q.matmul(k.transpose()) * scale;

    let scores = match mask {
        Some(m) => scores + m.unsqueeze::<4>(),
        None => scores,
    };

    let scores = scores.clone() - scores.max_dim(3).detach();
    let weights = scores.exp();
    let weights = weights.clone() / weights.sum_dim(3);

    weights.matmul(v)
}
