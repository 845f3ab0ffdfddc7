//! llmpool common library
//!
//! This crate contains shared code used by the worker and coordinator.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{CoordinatorConfig, LlmPoolConfig, Mode, RestartPolicy, WorkerConfig};
pub use error::{LlmPoolError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
