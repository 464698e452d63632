//! Backend selection
//!
//! Guidance needs gradients, so every default backend is wrapped in
//! [`Autodiff`]. Pick the inner backend with a feature flag:
//!
//! - `ndarray`: CPU backend using ndarray (default)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//!
//! ```toml
//! [dependencies]
//! burn-guided = { version = "0.1", default-features = false, features = ["wgpu"] }
//! ```

pub use burn_autodiff::Autodiff;

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Default backend when using the ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = Autodiff<NdArray>;

/// Default backend when using the wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Autodiff<Wgpu>;

/// Get the default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Name of the enabled backend, for logs
pub fn backend_name() -> &'static str {
    if cfg!(feature = "ndarray") {
        "ndarray"
    } else if cfg!(feature = "wgpu") {
        "wgpu"
    } else {
        "none"
    }
}
