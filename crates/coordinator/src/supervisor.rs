//! Worker process supervision
//!
//! One supervisor per slot owns the worker's child process and publishes the
//! slot's state through a `watch` channel. The state machine is
//!
//! ```text
//! Starting -> Running -> Crashed -> BackoffWait -> Starting -> ...
//!                           \-> Failed (restart budget exhausted)
//! ```
//!
//! A slot is ready only while `Running`, which is entered once the worker's
//! IPC socket accepts connections.

use llmpool_common::{CoordinatorConfig, LlmPoolError, RestartPolicy, Result, METRICS};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Process launched, IPC socket not accepting yet
    Starting,

    /// IPC socket accepting; `pid` is unknown for externally managed workers
    Running { pid: Option<u32> },

    /// Process exited
    Crashed,

    /// Waiting before the next launch
    BackoffWait,

    /// Restart budget exhausted; the slot stays down
    Failed,

    /// Supervisor shut down
    Stopped,
}

impl SlotState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SlotState::Running { .. })
    }
}

enum Exit {
    Crashed(String),
    Shutdown,
}

/// Restart loop for one worker process
pub struct Supervisor {
    id: usize,
    executable: PathBuf,
    args: Vec<OsString>,
    socket_path: PathBuf,
    policy: RestartPolicy,
    probe_interval: Duration,
    state: watch::Sender<SlotState>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        id: usize,
        config: &CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<SlotState>) {
        let (state, state_rx) = watch::channel(SlotState::Starting);

        let supervisor = Self {
            id,
            executable: config.worker_executable.clone(),
            args: config.worker_args(id),
            socket_path: config.socket_path(id),
            policy: config.restart.clone(),
            probe_interval: Duration::from_millis(config.ready_probe_interval_ms.max(1)),
            state,
            shutdown,
        };
        (supervisor, state_rx)
    }

    /// Keep the worker alive until shutdown or until the restart budget runs out
    pub async fn run(self) {
        let mut failures: u32 = 0;
        let mut launches: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if launches > 0 {
                METRICS.coordinator.worker_restarts.inc();
            }
            launches += 1;

            self.set(SlotState::Starting);
            let started = Instant::now();

            match self.run_once().await {
                Exit::Shutdown => break,
                Exit::Crashed(reason) => {
                    warn!("Worker process {} stopped: {}", self.id, reason);
                    self.set(SlotState::Crashed);
                }
            }

            if started.elapsed() >= self.policy.stable_after() {
                failures = 0;
            }
            failures += 1;

            if self.policy.exhausted(failures) {
                error!(
                    "Worker {} crashed {} times in a row, giving up",
                    self.id, failures
                );
                METRICS.coordinator.failed_workers.inc();
                self.set(SlotState::Failed);
                return;
            }

            let delay = self.policy.backoff(failures);
            debug!("Restarting worker {} in {:?}", self.id, delay);
            self.set(SlotState::BackoffWait);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.set(SlotState::Stopped);
        info!("Supervisor for worker {} stopped", self.id);
    }

    async fn run_once(&self) -> Exit {
        info!("Start worker process {}", self.id);

        let mut child = match self.launch() {
            Ok(child) => child,
            Err(e) => return Exit::Crashed(e.to_string()),
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_stdout(self.id, stdout));
        }
        let pid = child.id();

        tokio::select! {
            status = child.wait() => return Exit::Crashed(describe_exit(status)),
            _ = self.shutdown.cancelled() => {
                stop(self.id, &mut child).await;
                return Exit::Shutdown;
            }
            _ = self.wait_until_accepting() => {}
        }

        info!("Worker {} ready (pid {:?})", self.id, pid);
        self.set(SlotState::Running { pid });

        tokio::select! {
            status = child.wait() => Exit::Crashed(describe_exit(status)),
            _ = self.shutdown.cancelled() => {
                stop(self.id, &mut child).await;
                Exit::Shutdown
            }
        }
    }

    fn launch(&self) -> Result<Child> {
        Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LlmPoolError::spawn(format!("{}: {}", self.executable.display(), e))
            })
    }

    async fn wait_until_accepting(&self) {
        loop {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return;
            }
            tokio::time::sleep(self.probe_interval).await;
        }
    }

    fn set(&self, state: SlotState) {
        let previous = self.state.send_replace(state);
        match (previous.is_ready(), state.is_ready()) {
            (false, true) => METRICS.coordinator.ready_workers.inc(),
            (true, false) => METRICS.coordinator.ready_workers.dec(),
            _ => {}
        }
        if previous != state {
            debug!("Worker {} state {:?} -> {:?}", self.id, previous, state);
        }
    }
}

async fn stop(id: usize, child: &mut Child) {
    info!("Stopping worker process {}", id);
    if let Err(e) = child.kill().await {
        warn!("Failed to kill worker {}: {}", id, e);
    }
}

fn describe_exit(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => format!("exited with {}", status),
        Err(e) => format!("could not be waited on: {}", e),
    }
}

/// Relay the worker's stdout into the coordinator log
async fn forward_stdout(id: usize, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("[Worker {}] {}", id, line),
            Ok(None) => break,
            Err(e) => {
                warn!("[Worker {}] Read stdout got error: {}", id, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(executable: &str, restart: RestartPolicy) -> (CoordinatorConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            worker_executable: PathBuf::from(executable),
            model_path: dir.path().join("model.bin"),
            num_workers: 1,
            threads: 1,
            ctx_size: 512,
            socket_dir: dir.path().to_path_buf(),
            spawn_workers: true,
            ready_probe_interval_ms: 10,
            seed: -1,
            restart,
        };
        (config, dir)
    }

    #[test]
    fn test_only_running_is_ready() {
        assert!(SlotState::Running { pid: None }.is_ready());
        for state in [
            SlotState::Starting,
            SlotState::Crashed,
            SlotState::BackoffWait,
            SlotState::Failed,
            SlotState::Stopped,
        ] {
            assert!(!state.is_ready());
        }
    }

    #[tokio::test]
    async fn test_unlaunchable_worker_ends_failed() {
        let policy = RestartPolicy {
            max_restarts: Some(2),
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            stable_after_secs: 60,
        };
        let (config, _dir) = config("/nonexistent/llmpool-worker", policy);
        let (supervisor, mut state) = Supervisor::new(0, &config, CancellationToken::new());
        assert!(matches!(supervisor.launch(), Err(LlmPoolError::Spawn(_))));

        tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .unwrap();
        assert_eq!(*state.borrow_and_update(), SlotState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_stops_restart_loop() {
        let policy = RestartPolicy {
            max_restarts: None,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 10_000,
            stable_after_secs: 60,
        };
        let (config, _dir) = config("/nonexistent/llmpool-worker", policy);
        let token = CancellationToken::new();
        let (supervisor, mut state) = Supervisor::new(0, &config, token.clone());

        let task = tokio::spawn(supervisor.run());
        state
            .wait_for(|s| *s == SlotState::BackoffWait)
            .await
            .unwrap();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow(), SlotState::Stopped);
    }
}
