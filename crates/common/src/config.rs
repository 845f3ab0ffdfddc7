//! Configuration structures for llmpool
//!
//! This module defines all configuration types used by the worker and
//! coordinator processes. Configurations are loaded from YAML files; the
//! binaries can also build them from command-line flags.

use crate::error::{LlmPoolError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Hosts one engine and serves the IPC socket
    Worker,

    /// Supervises workers and dispatches jobs
    Coordinator,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Worker => f.write_str("worker"),
            Mode::Coordinator => f.write_str("coordinator"),
        }
    }
}

/// Top-level configuration for llmpool components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPoolConfig {
    /// Mode: either "worker" or "coordinator"
    pub mode: Mode,

    /// Worker-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    /// Coordinator-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Observability configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unix socket the IPC server binds to
    pub socket_path: PathBuf,

    /// Model file handed to the engine
    pub model_path: PathBuf,

    /// Engine compute threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Engine context size in tokens
    #[serde(default = "default_ctx_size")]
    pub ctx_size: usize,
}

/// Coordinator-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Worker executable launched for every slot
    pub worker_executable: PathBuf,

    /// Model file every worker loads
    pub model_path: PathBuf,

    /// Number of worker slots
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Engine compute threads per worker
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Engine context size per worker
    #[serde(default = "default_ctx_size")]
    pub ctx_size: usize,

    /// Directory holding the per-slot sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Launch and supervise worker processes. When false, the worker
    /// command lines are logged and the slots are assumed to be running.
    #[serde(default = "default_spawn_workers")]
    pub spawn_workers: bool,

    /// Interval between readiness probes of a starting worker
    #[serde(default = "default_ready_probe_interval")]
    pub ready_probe_interval_ms: u64,

    /// Seed applied to requests that leave it unset
    #[serde(default = "default_seed")]
    pub seed: i32,

    /// Restart policy for crashed workers
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Restart policy for a supervised worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Consecutive crashes tolerated before the slot is marked failed.
    /// `None` restarts forever.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: Option<u32>,

    /// First backoff delay, 0 restarts immediately
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// A worker that stayed up this long resets the crash counter
    #[serde(default = "default_stable_after")]
    pub stable_after_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            stable_after_secs: default_stable_after(),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Whether `failures` consecutive crashes exhaust the budget
    pub fn exhausted(&self, failures: u32) -> bool {
        matches!(self.max_restarts, Some(max) if failures > max)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Default value functions
fn default_threads() -> usize {
    4
}

fn default_ctx_size() -> usize {
    2048
}

fn default_num_workers() -> usize {
    2
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_spawn_workers() -> bool {
    true
}

fn default_ready_probe_interval() -> u64 {
    50
}

fn default_seed() -> i32 {
    -1
}

fn default_max_restarts() -> Option<u32> {
    Some(5)
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_stable_after() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LlmPoolConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LlmPoolError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: LlmPoolConfig = serde_yaml::from_str(&content).map_err(|e| {
            LlmPoolError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Build a worker-mode configuration
    pub fn for_worker(worker: WorkerConfig) -> Self {
        Self {
            mode: Mode::Worker,
            worker: Some(worker),
            coordinator: None,
            observability: None,
        }
    }

    /// Build a coordinator-mode configuration
    pub fn for_coordinator(coordinator: CoordinatorConfig) -> Self {
        Self {
            mode: Mode::Coordinator,
            worker: None,
            coordinator: Some(coordinator),
            observability: None,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Worker => {
                let worker = self
                    .worker
                    .as_ref()
                    .ok_or_else(|| LlmPoolError::config("Worker config required for worker mode"))?;
                if worker.threads == 0 {
                    return Err(LlmPoolError::config("threads must be positive"));
                }
            }
            Mode::Coordinator => {
                let coordinator = self.coordinator.as_ref().ok_or_else(|| {
                    LlmPoolError::config("Coordinator config required for coordinator mode")
                })?;
                if coordinator.num_workers == 0 {
                    return Err(LlmPoolError::config("num_workers must be positive"));
                }
                if coordinator.threads == 0 {
                    return Err(LlmPoolError::config("threads must be positive"));
                }
                let restart = &coordinator.restart;
                if restart.max_backoff_ms < restart.initial_backoff_ms {
                    return Err(LlmPoolError::config(
                        "restart.max_backoff_ms is below restart.initial_backoff_ms",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Default log filter directive
    pub fn log_level(&self) -> &str {
        self.observability
            .as_ref()
            .map(|o| o.log_level.as_str())
            .unwrap_or("info")
    }
}

impl CoordinatorConfig {
    /// Socket path owned by slot `id`
    pub fn socket_path(&self, id: usize) -> PathBuf {
        self.socket_dir.join(format!("llmpool-worker.{}.sock", id))
    }

    /// Command-line arguments that start the worker for slot `id`
    pub fn worker_args(&self, id: usize) -> Vec<OsString> {
        vec![
            "--mode".into(),
            Mode::Worker.to_string().into(),
            "--socket".into(),
            self.socket_path(id).into_os_string(),
            "--model".into(),
            self.model_path.clone().into_os_string(),
            "--threads".into(),
            self.threads.to_string().into(),
            "--ctx-size".into(),
            self.ctx_size.to_string().into(),
        ]
    }

    /// Printable worker command line for slot `id`
    pub fn worker_command_line(&self, id: usize) -> String {
        let mut line = self.worker_executable.display().to_string();
        for arg in self.worker_args(id) {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn coordinator_config() -> CoordinatorConfig {
        CoordinatorConfig {
            worker_executable: PathBuf::from("/usr/local/bin/llmpool-worker"),
            model_path: PathBuf::from("/models/7B/q4_0.bin"),
            num_workers: 2,
            threads: 4,
            ctx_size: 2048,
            socket_dir: PathBuf::from("/tmp"),
            spawn_workers: true,
            ready_probe_interval_ms: 50,
            seed: -1,
            restart: RestartPolicy::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        let config = LlmPoolConfig::for_coordinator(coordinator_config());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_missing_worker() {
        let config = LlmPoolConfig {
            mode: Mode::Worker,
            worker: None,
            coordinator: None,
            observability: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_workers() {
        let mut coordinator = coordinator_config();
        coordinator.num_workers = 0;
        assert!(LlmPoolConfig::for_coordinator(coordinator).validate().is_err());
    }

    #[test]
    fn test_from_file_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "mode: coordinator\ncoordinator:\n  worker_executable: /bin/llmpool-worker\n  model_path: /models/m.bin\n  restart:\n    max_restarts: null\n    initial_backoff_ms: 0"
        )
        .unwrap();

        let config = LlmPoolConfig::from_file(file.path()).unwrap();
        let coordinator = config.coordinator.unwrap();
        assert_eq!(coordinator.num_workers, 2);
        assert!(coordinator.spawn_workers);
        assert_eq!(coordinator.restart.max_restarts, None);
        assert_eq!(coordinator.restart.backoff(3), Duration::ZERO);
        assert!(!coordinator.restart.exhausted(1000));
    }

    #[test]
    fn test_restart_backoff_is_capped() {
        let policy = RestartPolicy {
            max_restarts: Some(3),
            initial_backoff_ms: 100,
            max_backoff_ms: 250,
            stable_after_secs: 30,
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(250));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn test_worker_command_line() {
        let config = coordinator_config();
        assert_eq!(config.socket_path(1), PathBuf::from("/tmp/llmpool-worker.1.sock"));
        assert_eq!(
            config.worker_command_line(0),
            "/usr/local/bin/llmpool-worker --mode worker --socket /tmp/llmpool-worker.0.sock \
             --model /models/7B/q4_0.bin --threads 4 --ctx-size 2048"
        );
    }
}
