//! The per-connection training coordinator and its worker loop.
//!
//! `start` spawns exactly one worker thread and returns immediately. The
//! worker builds the dataset and model, publishes the one-time architecture
//! event, then iterates epochs, checking the shared active flag every batch
//! so cancellation latency is bounded by one mini-batch. All publishes go
//! through the event sink; the worker never touches the connection itself.
//! Exactly one terminal event (complete, stopped, or error) ends every run,
//! and the active flag is cleared on every exit path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig};
use burn::record::CompactRecorder;
use burn::tensor::ElementConversion;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::backend::{backend_name, default_device, TrainingBackend};
use crate::dataset::{DigitBatch, DigitBatcher, DigitDataset, DEFAULT_SUBSET};
use crate::events::{EventSink, Update};
use crate::graph::{describe, extract_graph};
use crate::model::{build_model, ArchitectureConfig, DynamicCnn, OptimizerKind, TrainingParams};
use crate::viz::render_kernels;
use crate::INPUT_SHAPE;

use super::{DEFAULT_CHECKPOINT, SHUFFLE_SEED};

/// A client's `start_training` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequest {
    #[serde(default)]
    pub model_architecture: ArchitectureConfig,
    #[serde(default)]
    pub training_params: TrainingParams,
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Preparing,
    Training,
    Completed,
    Stopped,
    Failed,
}

/// Where the worker gets its samples.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// A bounded subset of the MNIST training split.
    Mnist { subset: usize },
    /// Deterministic noise, for tests and offline runs.
    Synthetic { samples: usize, seed: u64 },
}

/// Per-coordinator settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub data: DataSource,
    pub checkpoint_path: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            data: DataSource::Mnist {
                subset: DEFAULT_SUBSET,
            },
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT),
        }
    }
}

/// Owns one training run per client connection.
///
/// The only state shared with the worker thread is the active flag and the
/// event sink; the model, optimizer, and accumulators live exclusively on
/// the worker.
pub struct TrainingCoordinator {
    sink: Arc<dyn EventSink>,
    options: RunOptions,
    active: Arc<AtomicBool>,
    phase: Arc<Mutex<RunPhase>>,
    worker: Option<JoinHandle<()>>,
}

impl TrainingCoordinator {
    pub fn new(sink: Arc<dyn EventSink>, options: RunOptions) -> Self {
        Self {
            sink,
            options,
            active: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(Mutex::new(RunPhase::Idle)),
            worker: None,
        }
    }

    /// Start a run. Returns immediately; `false` if a run is already active.
    pub fn start(&mut self, request: TrainingRequest) -> bool {
        if self.active.load(Ordering::SeqCst) {
            warn!("Rejecting start_training: a run is already active on this connection");
            self.sink
                .emit(Update::status("A training run is already active"));
            return false;
        }

        // Reap the previous worker, if any.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.active.store(true, Ordering::SeqCst);
        set_phase(&self.phase, RunPhase::Preparing);
        let active = Arc::clone(&self.active);
        let phase = Arc::clone(&self.phase);
        let sink = Arc::clone(&self.sink);
        let options = self.options.clone();

        let spawned = std::thread::Builder::new()
            .name("training-worker".to_string())
            .spawn(move || worker_main(request, options, sink, active, phase));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(err) => {
                error!(error = %err, "Failed to spawn training worker");
                self.active.store(false, Ordering::SeqCst);
                set_phase(&self.phase, RunPhase::Failed);
                self.sink
                    .emit(Update::failed(format!("Error: could not start worker: {err}")));
                false
            }
        }
    }

    /// Request cooperative cancellation. The worker observes the flag at
    /// batch granularity and publishes the terminal "stopped" event itself.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Cancellation requested");
        }
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The run's current lifecycle phase.
    pub fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until the current worker exits. Used on session teardown and
    /// in tests; the worker always terminates after its terminal event.
    pub fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TrainingCoordinator {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

enum RunOutcome {
    Completed,
    Stopped,
}

fn set_phase(phase: &Mutex<RunPhase>, value: RunPhase) {
    *phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

/// Worker entry point: runs the whole pipeline, catches every failure mode
/// (including panics out of tensor ops), publishes exactly one terminal
/// event, and clears the active flag.
fn worker_main(
    request: TrainingRequest,
    options: RunOptions,
    sink: Arc<dyn EventSink>,
    active: Arc<AtomicBool>,
    phase: Arc<Mutex<RunPhase>>,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        run_training(&request, &options, sink.as_ref(), &active, &phase)
    }));

    match result {
        Ok(Ok(RunOutcome::Completed)) => {
            info!("Run completed");
            set_phase(&phase, RunPhase::Completed);
            sink.emit(Update::complete("Training complete!"));
        }
        Ok(Ok(RunOutcome::Stopped)) => {
            info!("Run stopped by request");
            set_phase(&phase, RunPhase::Stopped);
            sink.emit(Update::stopped("Training stopped"));
        }
        Ok(Err(err)) => {
            error!(error = ?err, "Run failed");
            set_phase(&phase, RunPhase::Failed);
            sink.emit(Update::failed(format!("Error: {err}")));
        }
        Err(panic) => {
            let cause = panic
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic");
            error!(cause, "Run panicked");
            set_phase(&phase, RunPhase::Failed);
            sink.emit(Update::failed(format!("Error: {cause}")));
        }
    }

    active.store(false, Ordering::SeqCst);
}

fn run_training(
    request: &TrainingRequest,
    options: &RunOptions,
    sink: &dyn EventSink,
    active: &AtomicBool,
    phase: &Mutex<RunPhase>,
) -> Result<RunOutcome> {
    let device = default_device();
    sink.emit(Update::status(format!(
        "Preparing dataset... device: {}",
        backend_name()
    )));

    let dataset = match &options.data {
        DataSource::Mnist { subset } => {
            DigitDataset::mnist_train(*subset).context("failed to load the MNIST dataset")?
        }
        DataSource::Synthetic { samples, seed } => DigitDataset::synthetic(*samples, *seed),
    };
    if dataset.is_empty() {
        bail!("the training dataset is empty");
    }

    let model = build_model::<TrainingBackend>(&request.model_architecture, &device)?;

    // The architecture event always precedes any epoch progress.
    let inference_model = model.valid();
    let graph = extract_graph(&inference_model, &INPUT_SHAPE, &device);
    let summary = describe(&inference_model);
    sink.emit(Update::architecture(summary, graph));

    let params = &request.training_params;
    set_phase(phase, RunPhase::Training);
    sink.emit(Update::status(format!(
        "Starting training: {} epochs, batch size {}, {} samples",
        params.epochs,
        params.batch_size,
        dataset.len()
    )));

    match params.optimizer {
        OptimizerKind::Adam => fit(model, AdamConfig::new().init(), params, &dataset, options, sink, active),
        OptimizerKind::AdamW => fit(model, AdamWConfig::new().init(), params, &dataset, options, sink, active),
        OptimizerKind::Sgd => fit(model, SgdConfig::new().init(), params, &dataset, options, sink, active),
        OptimizerKind::RmsProp => fit(model, RmsPropConfig::new().init(), params, &dataset, options, sink, active),
    }
}

/// The blocking epoch/batch loop. Owned entirely by the worker thread; the
/// active flag is the only cross-thread read.
fn fit<O>(
    mut model: DynamicCnn<TrainingBackend>,
    mut optimizer: O,
    params: &TrainingParams,
    dataset: &DigitDataset,
    options: &RunOptions,
    sink: &dyn EventSink,
    active: &AtomicBool,
) -> Result<RunOutcome>
where
    O: Optimizer<DynamicCnn<TrainingBackend>, TrainingBackend>,
{
    let device = default_device();
    let batcher = DigitBatcher;
    let batch_size = params.batch_size.max(1);
    let mut rng = ChaCha8Rng::seed_from_u64(SHUFFLE_SEED);

    for epoch in 1..=params.epochs {
        if !active.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Stopped);
        }

        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        indices.shuffle(&mut rng);
        let num_batches = indices.len().div_ceil(batch_size);

        let mut running_loss = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch_idx in 0..num_batches {
            // Cancellation is observed per batch for bounded latency.
            if !active.load(Ordering::SeqCst) {
                info!(epoch, batch = batch_idx, "Stopping mid-epoch");
                return Ok(RunOutcome::Stopped);
            }

            let start = batch_idx * batch_size;
            let end = (start + batch_size).min(indices.len());
            let items: Vec<_> = indices[start..end]
                .iter()
                .filter_map(|&i| dataset.get(i))
                .collect();
            if items.is_empty() {
                continue;
            }

            let batch: DigitBatch<TrainingBackend> = batcher.batch(items, &device);
            let batch_len = batch.targets.dims()[0];

            let output = model.forward(batch.images)?;
            let loss = CrossEntropyLossConfig::new()
                .init(&output.device())
                .forward(output.clone(), batch.targets.clone());

            let loss_value: f64 = loss.clone().into_scalar().elem();
            running_loss += loss_value * batch_len as f64;

            let predictions = output.argmax(1).squeeze::<1>(1);
            let batch_correct: i64 = predictions
                .equal(batch.targets)
                .int()
                .sum()
                .into_scalar()
                .elem();
            correct += batch_correct as usize;
            seen += batch_len;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(params.learning_rate, model, grads);
        }

        if !active.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Stopped);
        }

        let epoch_loss = running_loss / seen.max(1) as f64;
        let accuracy = 100.0 * correct as f64 / seen.max(1) as f64;

        let kernels = model
            .first_conv_weight()
            .map(|weight| render_kernels(&weight.into_data()))
            .unwrap_or_default();

        info!(
            epoch,
            loss = epoch_loss,
            accuracy,
            "Epoch {}/{} finished",
            epoch,
            params.epochs
        );
        sink.emit(Update::progress(
            epoch,
            epoch_loss,
            accuracy,
            kernels,
            format!("Epoch {}/{} complete", epoch, params.epochs),
        ));
    }

    save_checkpoint(&model, &options.checkpoint_path)?;
    Ok(RunOutcome::Completed)
}

/// Persist the trained parameters to the single named checkpoint target.
fn save_checkpoint(model: &DynamicCnn<TrainingBackend>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    model
        .clone()
        .save_file(path.to_path_buf(), &CompactRecorder::new())
        .map_err(|err| anyhow!("failed to save checkpoint: {err:?}"))?;

    info!(path = %path.display(), "Checkpoint saved");
    Ok(())
}
