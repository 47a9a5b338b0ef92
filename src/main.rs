//! MNIST Studio CLI.
//!
//! `serve` runs the WebSocket training server; `train` runs one training
//! request headlessly with progress written to the log, which is handy for
//! trying out architectures without a client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use mnist_studio::dataset::DEFAULT_SUBSET;
use mnist_studio::events::LogSink;
use mnist_studio::server;
use mnist_studio::training::{
    DataSource, RunOptions, TrainingCoordinator, TrainingRequest, DEFAULT_CHECKPOINT,
};

/// Interactive CNN training studio for MNIST.
#[derive(Parser, Debug)]
#[command(name = "mnist-studio")]
#[command(version)]
#[command(about = "Train declarative CNN architectures on MNIST with live introspection", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WebSocket training server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8000")]
        port: u16,

        /// Bounded MNIST subset size per run
        #[arg(long, env = "MNIST_STUDIO_SUBSET", default_value_t = DEFAULT_SUBSET)]
        subset: usize,

        /// Checkpoint target for completed runs
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,
    },

    /// Run a single training request headlessly
    Train {
        /// JSON request file ({"modelArchitecture": ..., "trainingParams": ...});
        /// defaults to a small two-layer CNN when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use the synthetic dataset instead of MNIST (no download needed)
        #[arg(long, default_value = "false")]
        synthetic: bool,

        /// Bounded dataset size
        #[arg(long, default_value_t = DEFAULT_SUBSET)]
        subset: usize,

        /// Checkpoint target for the completed run
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            subset,
            checkpoint,
        } => {
            println!("{}", "MNIST Studio server".green().bold());
            let options = RunOptions {
                data: DataSource::Mnist { subset },
                checkpoint_path: checkpoint,
            };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::serve(&host, port, options))
        }

        Commands::Train {
            config,
            synthetic,
            subset,
            checkpoint,
        } => {
            let request = match config {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {path:?}"))?;
                    serde_json::from_str::<TrainingRequest>(&raw)
                        .with_context(|| format!("failed to parse {path:?}"))?
                }
                None => TrainingRequest::default(),
            };

            let data = if synthetic {
                DataSource::Synthetic {
                    samples: subset,
                    seed: 42,
                }
            } else {
                DataSource::Mnist { subset }
            };

            println!("{}", "Starting training run...".green().bold());
            let options = RunOptions {
                data,
                checkpoint_path: checkpoint,
            };
            let mut coordinator = TrainingCoordinator::new(Arc::new(LogSink), options);
            coordinator.start(request);
            coordinator.join();

            println!("{}", "Done.".green());
            Ok(())
        }
    }
}
