//! # MNIST Studio
//!
//! An interactive CNN training service built on the Burn framework. Clients
//! submit a declarative architecture plus training parameters over a
//! persistent WebSocket connection and receive a live stream of training
//! progress: per-epoch loss and accuracy, the first convolution's kernels
//! rendered as images, and a structural graph of the model with inferred
//! tensor shapes.
//!
//! ## Modules
//!
//! - `model`: declarative architecture config and the dynamic module tree
//!   builder (plain CNN, attention CNN, small ResNet/DenseNet backbones)
//! - `graph`: shape inference and model-graph extraction for the client view
//! - `viz`: convolution-kernel rendering to inlineable PNG images
//! - `dataset`: MNIST loading, a synthetic source for offline runs, batching
//! - `training`: the per-connection training coordinator and worker loop
//! - `events`: outbound event payloads and the cross-thread event sink
//! - `server`: WebSocket transport wiring the above together

pub mod backend;
pub mod dataset;
pub mod events;
pub mod graph;
pub mod model;
pub mod server;
pub mod training;
pub mod viz;

pub use events::{EventSink, Update};
pub use graph::{extract_graph, infer_output_shape, ModelGraph};
pub use model::{build_model, ArchitectureConfig, DynamicCnn, TrainingParams};
pub use training::TrainingCoordinator;

/// Side length of the square input images (MNIST digits).
pub const IMAGE_SIZE: usize = 28;

/// Number of input channels (MNIST is grayscale).
pub const NUM_CHANNELS: usize = 1;

/// Number of output classes (digits 0-9).
pub const NUM_CLASSES: usize = 10;

/// Crate version, exposed for logging and the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The per-sample input shape, without the batch dimension.
pub const INPUT_SHAPE: [usize; 3] = [NUM_CHANNELS, IMAGE_SIZE, IMAGE_SIZE];
