//! llmpool Worker - Main Entry Point
//!
//! Loads the engine, starts the execution thread and serves the IPC socket.
//! Normally launched by the coordinator's supervisor, which forwards this
//! process's stdout into its own log.

use clap::Parser;
use llmpool_common::{LlmPoolConfig, LlmPoolError, Mode, Result, WorkerConfig};
use llmpool_worker::{EchoEngine, Engine, Executor, WorkerServer};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "llmpool-worker", about = "llmpool engine worker process")]
struct Args {
    /// YAML configuration file; flags below are ignored when set
    #[arg(long, env = "LLMPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Process mode
    #[arg(short = 'M', long, value_enum, default_value_t = Mode::Worker)]
    mode: Mode,

    /// Unix socket to serve on
    #[arg(short = 'S', long)]
    socket: Option<PathBuf>,

    /// Model file to load
    #[arg(short = 'm', long)]
    model: Option<PathBuf>,

    /// Engine compute threads
    #[arg(short = 't', long, default_value_t = 4)]
    threads: usize,

    /// Engine context size
    #[arg(short = 'c', long, default_value_t = 2048)]
    ctx_size: usize,
}

impl Args {
    fn into_config(self) -> Result<LlmPoolConfig> {
        if let Some(path) = self.config {
            return LlmPoolConfig::from_file(path);
        }

        let socket_path = self
            .socket
            .ok_or_else(|| LlmPoolError::config("--socket is required"))?;
        let model_path = self
            .model
            .ok_or_else(|| LlmPoolError::config("--model is required"))?;

        let mut config = LlmPoolConfig::for_worker(WorkerConfig {
            socket_path,
            model_path,
            threads: self.threads,
            ctx_size: self.ctx_size,
        });
        config.mode = self.mode;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llmpool_worker={}", config.log_level()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.mode != Mode::Worker {
        return Err(LlmPoolError::config(format!(
            "llmpool-worker cannot run in {} mode",
            config.mode
        )));
    }

    let worker_config = config
        .worker
        .as_ref()
        .ok_or_else(|| LlmPoolError::config("Worker config not found"))?;

    info!(
        "Starting llmpool worker: socket={}, model={}",
        worker_config.socket_path.display(),
        worker_config.model_path.display()
    );

    let mut engine = EchoEngine::new(
        &worker_config.model_path,
        worker_config.threads,
        worker_config.ctx_size,
    );
    if let Err(e) = engine.load() {
        error!("Cannot load model: {}", e);
        return Err(LlmPoolError::engine(e.to_string()));
    }

    let executor = Executor::spawn(engine)?;
    let server = WorkerServer::new(&worker_config.socket_path, executor);

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server.serve() => {
            if let Err(e) = &result {
                error!("Worker server stopped: {}", e);
            }
            result?;
        }
    }

    let _ = std::fs::remove_file(&worker_config.socket_path);
    info!("llmpool worker shutdown complete");
    Ok(())
}
