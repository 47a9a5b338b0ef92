//! Model module: declarative configuration and the dynamic architecture
//! builder.
//!
//! A client-supplied [`ArchitectureConfig`] is compiled into a [`DynamicCnn`]
//! — a tree of [`layers::DynLayer`] nodes — by [`build_model`]. Four
//! architecture families are supported: the plain layered CNN, the same
//! trunk augmented with squeeze-excitation attention, and two small
//! backbones (residual and densely-connected) adapted to the single-channel
//! input.

pub mod builder;
pub mod config;
pub mod layers;

pub use builder::{build_model, BuildError, DynamicCnn, FALLBACK_FEATURE_WIDTH, MIN_POOL_DIM};
pub use config::{
    ActivationKind, ArchitectureConfig, ArchitectureFamily, ConvLayerSpec, FcLayerSpec,
    OptimizerKind, TrainingParams,
};
pub use layers::{DynLayer, Feature, ForwardError};
