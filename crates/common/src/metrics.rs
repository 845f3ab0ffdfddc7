//! Metrics collection for llmpool
//!
//! This module provides Prometheus metrics for observability. The worker
//! and coordinator processes each populate their own half of the registry.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for llmpool
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub worker: WorkerMetrics,
    pub coordinator: CoordinatorMetrics,
}

/// Worker-process metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Jobs executed by the engine
    pub jobs_executed: IntCounter,

    /// Jobs whose terminal record carried an error
    pub jobs_failed: IntCounter,

    /// Duration of a single engine call
    pub predict_duration: Histogram,

    /// Jobs waiting for the execution thread
    pub queue_depth: IntGauge,

    /// Fragment records written to clients
    pub fragments_sent: IntCounter,

    /// Open IPC connections
    pub open_connections: IntGauge,
}

/// Coordinator-process metrics
#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    /// Jobs handed to a worker slot
    pub jobs_dispatched: IntCounter,

    /// Jobs rejected because no slot was ready
    pub no_workers_available: IntCounter,

    /// Jobs finished with an error by a worker client
    pub jobs_failed: IntCounter,

    /// Fresh connections dialed to workers
    pub worker_dials: IntCounter,

    /// Worker processes launched after a crash
    pub worker_restarts: IntCounter,

    /// Slots that exhausted their restart budget
    pub failed_workers: IntGauge,

    /// Slots currently accepting jobs
    pub ready_workers: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let predict_duration = Histogram::with_opts(
            HistogramOpts::new(
                "worker_predict_duration_seconds",
                "Engine predict call duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .expect("valid histogram definition");
        registry
            .register(Box::new(predict_duration.clone()))
            .expect("histogram registered once");

        let worker = WorkerMetrics {
            jobs_executed: counter(
                &registry,
                "worker_jobs_executed_total",
                "Total number of jobs executed by the engine",
            ),
            jobs_failed: counter(
                &registry,
                "worker_jobs_failed_total",
                "Total number of jobs that ended with an error",
            ),
            predict_duration,
            queue_depth: gauge(
                &registry,
                "worker_queue_depth",
                "Current depth of the execution queue",
            ),
            fragments_sent: counter(
                &registry,
                "worker_fragments_sent_total",
                "Total number of fragment records sent",
            ),
            open_connections: gauge(
                &registry,
                "worker_open_connections",
                "Current number of open IPC connections",
            ),
        };

        let coordinator = CoordinatorMetrics {
            jobs_dispatched: counter(
                &registry,
                "coordinator_jobs_dispatched_total",
                "Total number of jobs handed to a worker",
            ),
            no_workers_available: counter(
                &registry,
                "coordinator_no_workers_available_total",
                "Total jobs rejected due to no ready worker",
            ),
            jobs_failed: counter(
                &registry,
                "coordinator_jobs_failed_total",
                "Total jobs failed by a worker client",
            ),
            worker_dials: counter(
                &registry,
                "coordinator_worker_dials_total",
                "Total connections dialed to workers",
            ),
            worker_restarts: counter(
                &registry,
                "coordinator_worker_restarts_total",
                "Total worker processes relaunched",
            ),
            failed_workers: gauge(
                &registry,
                "coordinator_failed_workers",
                "Worker slots that exhausted their restart budget",
            ),
            ready_workers: gauge(
                &registry,
                "coordinator_ready_workers",
                "Worker slots currently accepting jobs",
            ),
        };

        MetricsRegistry {
            registry,
            worker,
            coordinator,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
