//! llmpool Coordinator - Main Entry Point
//!
//! Starts the worker pool and either runs one job from the command line or
//! keeps the pool up until Ctrl-C.

use clap::Parser;
use llmpool_common::{LlmPoolConfig, LlmPoolError, Result, METRICS};
use llmpool_coordinator::{Job, JobEvent, JobStream, WorkerManager};
use llmpool_proto::{Request, SamplingParams};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long a one-shot job waits for the first worker to come up
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "llmpool-coordinator", about = "llmpool worker pool coordinator")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "LLMPOOL_CONFIG", default_value = "configs/coordinator.yaml")]
    config: PathBuf,

    /// Run one completion job and exit
    #[arg(long, conflicts_with = "tokenize")]
    prompt: Option<String>,

    /// Run one tokenize job and exit
    #[arg(long)]
    tokenize: Option<String>,

    /// Token budget of the one-shot completion
    #[arg(long)]
    tokens: Option<u32>,

    /// Print the Prometheus metrics to stderr before exiting
    #[arg(long)]
    dump_metrics: bool,
}

impl Args {
    fn request(&self, seed: i32) -> Option<Request> {
        if let Some(prompt) = &self.prompt {
            let mut params = self
                .tokens
                .map(SamplingParams::with_tokens)
                .unwrap_or_default();
            if params.seed == -1 {
                params.seed = seed;
            }
            return Some(Request::Completion {
                prompt: prompt.clone(),
                params,
            });
        }

        self.tokenize.as_ref().map(|prompt| Request::Tokenize {
            prompt: prompt.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = LlmPoolConfig::from_file(&args.config)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llmpool_coordinator={}", config.log_level()).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let coordinator_config = config
        .coordinator
        .clone()
        .ok_or_else(|| LlmPoolError::config("Coordinator config not found"))?;

    info!(
        "Starting llmpool coordinator: workers={}, model={}",
        coordinator_config.num_workers,
        coordinator_config.model_path.display()
    );

    let request = args.request(coordinator_config.seed);
    if let Some(request) = &request {
        request.validate()?;
    }

    let mut manager = WorkerManager::new(coordinator_config);
    manager.start_workers()?;

    let result = match request {
        Some(request) => run_one(&manager, request).await,
        None => {
            info!("llmpool coordinator running");
            signal::ctrl_c().await.map_err(LlmPoolError::from).map(|_| {
                info!("Received shutdown signal");
            })
        }
    };

    manager.shutdown().await;
    if args.dump_metrics {
        eprint!("{}", METRICS.gather());
    }
    info!("llmpool coordinator shutdown complete");
    result
}

async fn run_one(manager: &WorkerManager, request: Request) -> Result<()> {
    if !manager.wait_for_ready(READY_TIMEOUT).await {
        return Err(LlmPoolError::worker_unavailable(format!(
            "no worker became ready within {:?}",
            READY_TIMEOUT
        )));
    }

    let (job, stream) = Job::new(request);
    info!("Dispatching job {}", job.id());

    let (_, printed) = tokio::join!(manager.dispatch_job(job), print_stream(stream));
    printed
}

/// Write fragments to stdout as they arrive
async fn print_stream(mut stream: JobStream) -> Result<()> {
    let mut stdout = tokio::io::stdout();

    while let Some(event) = stream.next().await {
        match event {
            JobEvent::Fragment(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            JobEvent::Done(outcome) => {
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
                info!("Job {} finished: {}", stream.id(), outcome.reason);
                if let Some(err) = outcome.error {
                    error!("Job {} failed: {}", stream.id(), err);
                    return Err(LlmPoolError::engine(err));
                }
            }
        }
    }
    Ok(())
}
