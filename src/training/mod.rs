//! Training orchestration.
//!
//! One [`TrainingCoordinator`] exists per client connection. Each accepted
//! request spawns a dedicated worker thread running the blocking optimize
//! loop; progress is published through the connection's event sink and
//! cancellation is cooperative, observed at batch granularity.

pub mod coordinator;

pub use coordinator::{
    DataSource, RunOptions, RunPhase, TrainingCoordinator, TrainingRequest,
};

/// Seed for the per-epoch shuffling RNG.
pub const SHUFFLE_SEED: u64 = 42;

/// Default checkpoint target, overwritten on each completed run.
pub const DEFAULT_CHECKPOINT: &str = "output/trained_cnn_model";
