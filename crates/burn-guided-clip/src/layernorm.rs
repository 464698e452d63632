//! Layer normalization over the last dimension

use burn::prelude::*;

/// `y = (x - mean) / sqrt(var + eps) * weight + bias`
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter
    pub weight: Tensor<B, 1>,
    /// Shift parameter
    pub bias: Tensor<B, 1>,
    /// Added to the variance
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Identity layer norm over a last dimension of `size`
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            bias: Tensor::zeros([size], device),
            eps: 1e-5,
        }
    }

    /// Builds a layer norm from loaded weights
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            eps: 1e-5,
        }
    }

    /// Normalizes over the last dimension
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of any rank
    ///
    /// # Returns
    ///
    /// Tensor with the same shape as `x`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var_bias(last_dim);
        let x = (x - mean) / (var + self.eps).sqrt();
        x * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_normalizes_rows() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::new(4, &device);
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0, 4.0], [-2.0, 0.0, 2.0, 4.0]], &device);
        let y = norm.forward(x);

        let mean: f32 = y.clone().mean_dim(1).abs().max().into_scalar().elem();
        assert!(mean < 1e-6);
        let var: f32 = y.var_bias(1).mean().into_scalar().elem();
        assert!((var - 1.0).abs() < 1e-3);
    }
}
