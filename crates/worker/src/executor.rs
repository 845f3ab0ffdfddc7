//! Single-consumer execution queue
//!
//! All connections submit into one queue. A dedicated OS thread owns the
//! engine and runs queued jobs strictly one after another, streaming the
//! resulting wire records back to the submitting connection.

use crate::engine::Engine;
use crate::fragment::FragmentBuffer;
use crossbeam::channel;
use llmpool_common::{LatencyTimer, LlmPoolError, Result, METRICS};
use llmpool_proto::{FinishReason, Request, WireResponse};
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Records buffered per job before the engine thread blocks on the client
const RECORD_BUFFER: usize = 128;

/// A queued job and the channel its records go to
struct ExecJob {
    request: Request,
    records: mpsc::Sender<WireResponse>,
}

/// Handle to the engine thread
#[derive(Debug, Clone)]
pub struct Executor {
    queue: channel::Sender<ExecJob>,
}

impl Executor {
    /// Move a loaded engine onto its own thread and start consuming jobs
    pub fn spawn<E: Engine>(engine: E) -> Result<Self> {
        let (queue, jobs) = channel::unbounded::<ExecJob>();

        std::thread::Builder::new()
            .name("llmpool-engine".to_string())
            .spawn(move || run_queue(engine, jobs))
            .map_err(|e| LlmPoolError::internal(format!("Failed to start engine thread: {}", e)))?;

        Ok(Self { queue })
    }

    /// Queue a request. Records arrive on the returned channel; the last one
    /// is always terminal unless the engine thread dies mid-job.
    pub fn submit(&self, request: Request) -> Result<mpsc::Receiver<WireResponse>> {
        let (records, rx) = mpsc::channel(RECORD_BUFFER);

        self.queue
            .send(ExecJob { request, records })
            .map_err(|_| LlmPoolError::internal("engine thread is not running"))?;
        METRICS.worker.queue_depth.inc();

        Ok(rx)
    }
}

fn run_queue<E: Engine>(mut engine: E, jobs: channel::Receiver<ExecJob>) {
    info!("Engine thread started");

    for job in jobs {
        METRICS.worker.queue_depth.dec();
        let ExecJob { request, records } = job;

        let mut emit = |record: WireResponse| {
            // A vanished client does not stop the engine; the records are
            // dropped and the job runs to completion.
            if records.blocking_send(record).is_err() {
                debug!("Client went away, discarding record");
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_job(&mut engine, &request, &mut emit)
        }));

        if outcome.is_err() {
            // Engine state can no longer be trusted; let the supervisor
            // start a fresh process.
            error!("Engine panicked while running a {} job, exiting", request.kind());
            std::process::exit(1);
        }
    }

    info!("Engine thread stopped");
}

/// Run one request against the engine, emitting fragment records followed by
/// exactly one terminal record.
pub fn run_job<E: Engine + ?Sized>(
    engine: &mut E,
    request: &Request,
    emit: &mut dyn FnMut(WireResponse),
) {
    METRICS.worker.jobs_executed.inc();

    let terminal = match request {
        Request::Completion { prompt, params } => {
            let mut buffer = FragmentBuffer::new();
            let mut on_piece = |piece: &[u8]| {
                if let Some(text) = buffer.push(piece) {
                    METRICS.worker.fragments_sent.inc();
                    emit(WireResponse::fragment(vec![text]));
                }
            };

            let result = METRICS
                .worker
                .predict_duration
                .time(|| engine.predict(params, prompt, &mut on_piece));

            if let Some(rest) = buffer.finish() {
                METRICS.worker.fragments_sent.inc();
                emit(WireResponse::fragment(vec![rest]));
            }

            match result {
                Ok(reason) => {
                    debug!("Completion finished: {}", reason);
                    WireResponse::terminal(reason, None)
                }
                Err(e) => {
                    warn!("Engine reported failure: {}", e);
                    METRICS.worker.jobs_failed.inc();
                    WireResponse::terminal(FinishReason::Error, Some(e.0))
                }
            }
        }
        Request::Tokenize { prompt } => {
            let tokens = engine.tokenize_prompt(prompt);
            debug!("Tokenized prompt into {} tokens", tokens.len());
            METRICS.worker.fragments_sent.inc();
            emit(WireResponse::fragment(tokens));
            WireResponse::terminal(FinishReason::Finish, None)
        }
    };

    emit(terminal);
}
