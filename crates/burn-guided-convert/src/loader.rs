//! Memory-mapped `.safetensors` access

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// An opened checkpoint; tensor data stays in the mapping until loaded
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

impl std::fmt::Debug for SafeTensorFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeTensorFile")
            .field("tensors", &self.tensors.len())
            .field("bytes", &self.mmap.len())
            .finish()
    }
}

impl SafeTensorFile {
    /// Memory-maps a safetensors file and reads its header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let base = mmap.as_ptr() as usize;
        let tensors = {
            let st = SafeTensors::deserialize(&mmap)?;
            st.tensors()
                .into_iter()
                .map(|(name, view)| {
                    let start = view.data().as_ptr() as usize - base;
                    let info = TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    };
                    (name, info)
                })
                .collect()
        };

        Ok(Self { mmap, tensors })
    }

    /// Tensor names, in no particular order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// True if a tensor called `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Shape of `name`, if present
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Whether any tensor name starts with `prefix`
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.tensors.keys().any(|name| name.starts_with(prefix))
    }

    /// Loads a tensor as f32, converting from f16/bf16
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let shape: [usize; D] =
            info.shape
                .clone()
                .try_into()
                .map_err(|actual| LoadError::ShapeMismatch {
                    name: name.to_string(),
                    expected: vec![0; D],
                    actual,
                })?;

        // mmap data may be unaligned, so decode byte-wise
        let bytes = &self.mmap[info.start..info.end];
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                });
            }
        };

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }

    /// Loads a tensor and checks its exact shape
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let actual = self
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;
        if actual != expected.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }
        self.load_f32(name, device)
    }
}

/// Writes named f32 tensors `(name, shape, values)` to a `.safetensors` file
pub fn save_f32<P: AsRef<Path>>(
    path: P,
    tensors: &[(&str, Vec<usize>, Vec<f32>)],
) -> Result<(), LoadError> {
    let bytes: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, _, values)| values.iter().flat_map(|v| v.to_le_bytes()).collect())
        .collect();

    let views = tensors
        .iter()
        .zip(&bytes)
        .map(|((name, shape, _), data)| Ok((*name, TensorView::new(Dtype::F32, shape.clone(), data)?)))
        .collect::<Result<Vec<_>, LoadError>>()?;

    safetensors::serialize_to_file(views, None, path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.safetensors");
        save_f32(
            &path,
            &[
                ("a.weight", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
                ("a.bias", vec![3], vec![0.5, -0.5, 0.0]),
            ],
        )
        .unwrap();

        let device = Default::default();
        let file = SafeTensorFile::open(&path).unwrap();
        assert!(file.contains("a.weight"));
        assert!(file.has_prefix("a."));
        assert_eq!(file.shape("a.bias"), Some([3].as_slice()));

        let w: Tensor<TestBackend, 2> = file.load_f32("a.weight", &device).unwrap();
        assert_eq!(w.dims(), [2, 3]);
        assert_eq!(
            w.into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn test_missing_and_mismatched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.safetensors");
        save_f32(&path, &[("x", vec![4], vec![0.0; 4])]).unwrap();

        let device = Default::default();
        let file = SafeTensorFile::open(&path).unwrap();

        let err = file.load_f32::<TestBackend, 1>("y", &device).unwrap_err();
        assert!(matches!(err, LoadError::TensorNotFound(name) if name == "y"));

        let err = file.load_f32::<TestBackend, 2>("x", &device).unwrap_err();
        assert!(matches!(err, LoadError::ShapeMismatch { .. }));

        let err = file
            .load_f32_checked::<TestBackend, 1>("x", [3], &device)
            .unwrap_err();
        assert!(err.to_string().contains("expected [3], got [4]"));
    }
}
