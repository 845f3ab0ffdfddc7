//! Worker IPC server implementation

use crate::executor::Executor;
use llmpool_common::{LlmPoolError, Result, METRICS};
use llmpool_proto::{decode_line, encode_line, FinishReason, Request, WireRequest, WireResponse};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Worker IPC server
pub struct WorkerServer {
    socket_path: PathBuf,
    executor: Executor,
}

impl WorkerServer {
    /// Create a new worker server
    pub fn new(socket_path: impl Into<PathBuf>, executor: Executor) -> Self {
        Self {
            socket_path: socket_path.into(),
            executor,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, reclaiming a stale file left by a previous process
    pub fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                LlmPoolError::config(format!(
                    "Cannot remove stale socket {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Worker IPC server listening on {}", self.socket_path.display());
        Ok(listener)
    }

    /// Bind and accept connections until the listener fails
    pub async fn serve(self) -> Result<()> {
        let listener = self.bind()?;
        self.serve_listener(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve_listener(self, listener: UnixListener) -> Result<()> {
        let mut next_conn: u64 = 0;

        loop {
            let (stream, _) = listener.accept().await?;
            next_conn += 1;
            let conn_id = next_conn;
            let executor = self.executor.clone();

            tokio::spawn(async move {
                METRICS.worker.open_connections.inc();
                debug!("Connection {} opened", conn_id);

                if let Err(e) = handle_connection(stream, executor).await {
                    warn!("Connection {} closed with error: {}", conn_id, e);
                } else {
                    debug!("Connection {} closed", conn_id);
                }

                METRICS.worker.open_connections.dec();
            });
        }
    }
}

/// Serve requests on one connection, one at a time
async fn handle_connection(stream: UnixStream, executor: Executor) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        // A record that is not JSON leaves the stream in an unknown state
        let wire: WireRequest = decode_line(&line)?;

        let request = match Request::try_from(wire) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting request: {}", e);
                let terminal = WireResponse::terminal(FinishReason::Error, Some(e.to_string()));
                write_record(&mut write_half, &terminal).await?;
                continue;
            }
        };

        debug!("Queueing {} job", request.kind());
        let mut records = match executor.submit(request) {
            Ok(records) => records,
            Err(e) => {
                error!("Cannot queue job: {}", e);
                let terminal = WireResponse::terminal(FinishReason::Error, Some(e.to_string()));
                write_record(&mut write_half, &terminal).await?;
                return Err(e);
            }
        };

        let mut terminated = false;
        while let Some(record) = records.recv().await {
            terminated = record.is_terminal();
            write_record(&mut write_half, &record).await?;
            if terminated {
                break;
            }
        }

        if !terminated {
            let terminal =
                WireResponse::terminal(FinishReason::Error, Some("job aborted".to_string()));
            write_record(&mut write_half, &terminal).await?;
        }
    }
}

async fn write_record<W>(writer: &mut W, record: &WireResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_line(record)?).await?;
    Ok(())
}
