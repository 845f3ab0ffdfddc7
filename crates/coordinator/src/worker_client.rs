//! Worker client for communication from coordinator to workers
//!
//! Each client owns at most one connection to its worker and runs one job at
//! a time: the request is written, then wire records are relayed into the job
//! until the terminal record arrives. Any I/O or decode failure fails the
//! current job and drops the connection; the next job dials again.

use crate::job::Job;
use llmpool_common::{LlmPoolError, Result, METRICS};
use llmpool_proto::{decode_line, encode_line, WireRequest, WireResponse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A job together with the permit that marks its client busy
type Handoff = (Job, OwnedSemaphorePermit);

/// Sending side of a client's intake.
///
/// The client holds a single permit for the whole run of a job, so a send
/// completes only once the client is idle and never queues behind a running
/// job.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: usize,
    intake: mpsc::Sender<Handoff>,
    idle: Arc<Semaphore>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a job to the client, returning it if the client has stopped
    pub async fn send(&self, job: Job) -> std::result::Result<(), Job> {
        let permit = match self.idle.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(job),
        };
        self.intake.send((job, permit)).await.map_err(|e| e.0 .0)
    }
}

/// Dispatcher-side driver for one worker process
#[derive(Debug)]
pub struct WorkerClient {
    id: usize,
    socket_path: PathBuf,
    conn: Option<BufReader<UnixStream>>,
}

impl WorkerClient {
    pub fn new(id: usize, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            socket_path: socket_path.into(),
            conn: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Start the dispatch loop
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (intake, jobs) = mpsc::channel(1);
        let handle = WorkerHandle {
            id: self.id,
            intake,
            idle: Arc::new(Semaphore::new(1)),
        };
        let task = tokio::spawn(self.run(jobs));
        (handle, task)
    }

    async fn run(mut self, mut jobs: mpsc::Receiver<Handoff>) {
        debug!("Worker client {} started", self.id);

        while let Some((job, _busy)) = jobs.recv().await {
            self.process(job).await;
        }

        debug!("Worker client {} stopped", self.id);
    }

    /// Run one job end to end against the worker
    pub async fn process(&mut self, job: Job) {
        let job_id = job.id();
        debug!("Worker client {} running job {}", self.id, job_id);

        match self.exchange(&job).await {
            Ok(terminal) => {
                let reason = terminal.finish_reason();
                let error = terminal.error().map(str::to_string);
                debug!("Job {} finished on worker {}: {}", job_id, self.id, reason);
                job.finish(reason, error);
            }
            Err(e) => {
                warn!("Job {} failed on worker {}: {}", job_id, self.id, e);
                METRICS.coordinator.jobs_failed.inc();
                if self.conn.take().is_some() {
                    info!("Dropped connection to worker {}", self.id);
                }
                job.fail(e);
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut BufReader<UnixStream>> {
        if self.conn.is_none() {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                LlmPoolError::connection(format!(
                    "cannot dial {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;
            METRICS.coordinator.worker_dials.inc();
            debug!("Worker client {} connected to {}", self.id, self.socket_path.display());
            self.conn = Some(BufReader::new(stream));
        }

        self.conn
            .as_mut()
            .ok_or_else(|| LlmPoolError::internal("connection missing after dial"))
    }

    async fn exchange(&mut self, job: &Job) -> Result<WireResponse> {
        let line = encode_line(&WireRequest::from(job.request()))?;
        let conn = self.connection().await?;

        conn.get_mut()
            .write_all(&line)
            .await
            .map_err(|e| LlmPoolError::connection(format!("send failed: {}", e)))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let n = conn
                .read_line(&mut buf)
                .await
                .map_err(|e| LlmPoolError::connection(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(LlmPoolError::connection("unexpected end of stream"));
            }

            let record: WireResponse = decode_line(&buf)?;
            if record.is_terminal() {
                return Ok(record);
            }
            for text in record.text {
                job.push(text).await;
            }
        }
    }
}
