//! Backend selection.
//!
//! Training runs on the CPU `ndarray` backend by default so the service works
//! everywhere; the `wgpu` feature swaps in GPU execution.

use burn::backend::Autodiff;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;

/// The autodiff backend used for training.
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// The inner backend used for inference, shape probing, and evaluation.
pub type InferenceBackend = DefaultBackend;

/// Get the default device for the selected backend.
pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

/// Human-readable name for the current backend, used in status messages.
pub fn backend_name() -> &'static str {
    #[cfg(not(feature = "wgpu"))]
    {
        "CPU (ndarray)"
    }
    #[cfg(feature = "wgpu")]
    {
        "GPU (wgpu)"
    }
}
