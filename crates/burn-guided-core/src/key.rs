//! Splittable random keys
//!
//! Every stochastic operation in the sampler consumes a [`RandomKey`].
//! Keys are moved, never copied: deriving fresh randomness goes through
//! [`RandomKey::split`], so the same draw can't accidentally be reused
//! for two purposes. Given the same seed, the whole sampling run is
//! reproducible.

use burn::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Golden-ratio increment of the splitmix64 sequence
const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// A single-use source of randomness
///
/// Deliberately neither `Copy` nor `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct RandomKey {
    state: u64,
}

impl RandomKey {
    /// Creates the root key for a run
    pub fn new(seed: u64) -> Self {
        Self { state: mix(seed) }
    }

    /// The fixed key passed to models that ignore randomness
    pub fn dummy() -> Self {
        Self::new(0)
    }

    /// Splits into two independent keys
    pub fn split(self) -> (Self, Self) {
        let mut children = self.split_n(2).into_iter();
        match (children.next(), children.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => unreachable!("split_n(2) yields two keys"),
        }
    }

    /// Splits into `n` independent keys
    pub fn split_n(self, n: usize) -> Vec<Self> {
        (1..=n as u64)
            .map(|i| Self {
                state: mix(self.state.wrapping_add(GAMMA.wrapping_mul(i))),
            })
            .collect()
    }

    /// Draws a tensor of standard normal samples
    pub fn normal<B: Backend, const D: usize>(
        self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let mut rng = self.into_rng();
        let numel = shape.iter().product();
        let values: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Draws `count` values uniformly from `[low, high)`
    pub fn uniform(self, count: usize, low: f32, high: f32) -> Vec<f32> {
        let mut rng = self.into_rng();
        (0..count)
            .map(|_| low + (high - low) * rng.random::<f32>())
            .collect()
    }

    fn into_rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.state)
    }
}

/// splitmix64 finalizer
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_seed_same_children() {
        let (a1, b1) = RandomKey::new(7).split();
        let (a2, b2) = RandomKey::new(7).split();
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);
        assert_ne!(a1, b1);
    }

    #[test]
    fn test_split_n_distinct() {
        let keys = RandomKey::new(0).split_n(16);
        assert_eq!(keys.len(), 16);
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j]);
            }
        }
    }

    #[test]
    fn test_dummy_is_seed_zero() {
        assert_eq!(RandomKey::dummy(), RandomKey::new(0));
    }

    #[test]
    fn test_normal_deterministic() {
        let device = Default::default();
        let a: Tensor<TestBackend, 2> = RandomKey::new(3).normal([4, 8], &device);
        let b: Tensor<TestBackend, 2> = RandomKey::new(3).normal([4, 8], &device);
        assert_eq!(a.dims(), [4, 8]);
        let a = a.into_data().to_vec::<f32>().unwrap();
        let b = b.into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_normal_moments() {
        let device = Default::default();
        let x: Tensor<TestBackend, 1> = RandomKey::new(11).normal([20_000], &device);
        let mean: f32 = x.clone().mean().into_scalar().elem();
        let var: f32 = x.var(0).into_scalar().elem();
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    #[test]
    fn test_uniform_bounds() {
        let values = RandomKey::new(5).uniform(1000, -8.0, 8.0);
        assert!(values.iter().all(|v| (-8.0..8.0).contains(v)));
        assert!(values.iter().any(|v| *v < 0.0));
        assert!(values.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn test_uniform_degenerate_range() {
        let values = RandomKey::new(5).uniform(4, 0.0, 0.0);
        assert_eq!(values, vec![0.0; 4]);
    }
}
