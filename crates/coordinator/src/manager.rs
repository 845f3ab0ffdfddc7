//! Worker pool management and job routing
//!
//! The manager owns a fixed set of slots. Each slot pairs a worker client
//! with the state published by that slot's supervisor. Jobs go to the first
//! ready slot in slot order.

use crate::job::Job;
use crate::supervisor::{SlotState, Supervisor};
use crate::worker_client::{WorkerClient, WorkerHandle};
use llmpool_common::{CoordinatorConfig, LlmPoolError, Result, METRICS};
use llmpool_proto::FinishReason;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error carried by jobs dispatched while no slot is ready
pub const NO_AVAILABLE_WORKER: &str = "no available worker";

/// One worker in the pool
#[derive(Debug)]
pub struct WorkerSlot {
    id: usize,
    handle: WorkerHandle,
    state: watch::Receiver<SlotState>,
}

impl WorkerSlot {
    pub fn new(id: usize, handle: WorkerHandle, state: watch::Receiver<SlotState>) -> Self {
        Self { id, handle, state }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SlotState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }
}

/// Pool of worker processes and the router in front of them
pub struct WorkerManager {
    config: Option<CoordinatorConfig>,
    slots: Vec<WorkerSlot>,
    tasks: Vec<JoinHandle<()>>,
    /// Keeps the state of externally managed slots alive
    static_states: Vec<watch::Sender<SlotState>>,
    shutdown: CancellationToken,
}

impl WorkerManager {
    /// Create a manager for the configured pool; nothing starts until
    /// [`WorkerManager::start_workers`].
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config: Some(config),
            slots: Vec::new(),
            tasks: Vec::new(),
            static_states: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a manager over slots whose processes are managed elsewhere
    pub fn from_slots(slots: Vec<WorkerSlot>) -> Self {
        Self {
            config: None,
            slots,
            tasks: Vec::new(),
            static_states: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Launch one supervised worker per slot and start every client loop
    pub fn start_workers(&mut self) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| LlmPoolError::config("manager has no pool configuration"))?;
        if !self.slots.is_empty() {
            return Err(LlmPoolError::internal("workers already started"));
        }

        for id in 0..config.num_workers {
            let socket_path = config.socket_path(id);

            let state = if config.spawn_workers {
                let (supervisor, state) = Supervisor::new(id, &config, self.shutdown.clone());
                self.tasks.push(tokio::spawn(supervisor.run()));
                state
            } else {
                info!("Start worker {} using below command:", id);
                info!("{}", config.worker_command_line(id));
                let (tx, rx) = watch::channel(SlotState::Running { pid: None });
                self.static_states.push(tx);
                rx
            };

            let (handle, task) = WorkerClient::new(id, &socket_path).spawn();
            self.tasks.push(task);
            self.slots.push(WorkerSlot::new(id, handle, state));
        }

        info!("Started {} worker slots", self.slots.len());
        Ok(())
    }

    /// Route a job to the first ready slot.
    ///
    /// Waits while the chosen slot is busy; there is no re-routing. With no
    /// ready slot the job is failed immediately. Returns the slot the job was
    /// handed to.
    pub async fn dispatch_job(&self, job: Job) -> Option<usize> {
        let Some(slot) = self.slots.iter().find(|s| s.is_ready()) else {
            warn!("No available worker for job {}", job.id());
            METRICS.coordinator.no_workers_available.inc();
            job.finish(FinishReason::Error, Some(NO_AVAILABLE_WORKER.to_string()));
            return None;
        };

        debug!("Dispatching job {} to worker {}", job.id(), slot.id);
        match slot.handle.send(job).await {
            Ok(()) => {
                METRICS.coordinator.jobs_dispatched.inc();
                Some(slot.id)
            }
            Err(job) => {
                warn!("Worker {} client is gone, failing job {}", slot.id, job.id());
                job.fail(LlmPoolError::worker_unavailable(format!(
                    "worker {} is not accepting jobs",
                    slot.id
                )));
                None
            }
        }
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Current state of every slot, in slot order
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(WorkerSlot::state).collect()
    }

    /// Watch a slot's state changes
    pub fn subscribe(&self, id: usize) -> Option<watch::Receiver<SlotState>> {
        self.slots.get(id).map(|s| s.state.clone())
    }

    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_ready()).count()
    }

    /// Wait until at least one slot is ready
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let mut waiters = JoinSet::new();
        for slot in &self.slots {
            let mut state = slot.state.clone();
            waiters.spawn(async move {
                let ready = state.wait_for(SlotState::is_ready).await.is_ok();
                ready
            });
        }

        let any_ready = async {
            while let Some(joined) = waiters.join_next().await {
                if let Ok(true) = joined {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(timeout, any_ready).await.unwrap_or(false)
    }

    /// Kill every worker process and stop all client loops
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        self.shutdown.cancel();

        // Closing the intakes ends the client loops
        drop(self.slots);
        for task in self.tasks {
            let _ = task.await;
        }
        drop(self.static_states);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobEvent, JobOutcome};
    use crate::worker_client::tests::{Fault, FakeWorker};
    use llmpool_proto::{encode_line, SamplingParams, WireResponse};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;
    use tokio::sync::oneshot;

    fn slot(id: usize, client: WorkerClient, state: SlotState) -> (WorkerSlot, watch::Sender<SlotState>) {
        let (handle, _task) = client.spawn();
        let (tx, rx) = watch::channel(state);
        (WorkerSlot::new(id, handle, rx), tx)
    }

    #[tokio::test]
    async fn test_dispatch_without_ready_worker_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (s0, _t0) = slot(0, WorkerClient::new(0, dir.path().join("0.sock")), SlotState::Starting);
        let (s1, _t1) = slot(1, WorkerClient::new(1, dir.path().join("1.sock")), SlotState::Failed);
        let manager = WorkerManager::from_slots(vec![s0, s1]);

        let (job, mut stream) = Job::completion("hi", SamplingParams::default());
        assert_eq!(manager.dispatch_job(job).await, None);

        // Resolved before dispatch_job returned
        let event = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(JobEvent::Done(JobOutcome::failed(NO_AVAILABLE_WORKER)))
        );
    }

    #[tokio::test]
    async fn test_earliest_ready_slot_is_preferred() {
        let fake0 = FakeWorker::start(Fault::None);
        let fake1 = FakeWorker::start(Fault::None);
        let (s0, t0) = slot(0, WorkerClient::new(0, &fake0.path), SlotState::Starting);
        let (s1, _t1) = slot(1, WorkerClient::new(1, &fake1.path), SlotState::Running { pid: None });
        let manager = WorkerManager::from_slots(vec![s0, s1]);
        assert_eq!(manager.ready_count(), 1);

        let (job, stream) = Job::completion("ab", SamplingParams::default());
        assert_eq!(manager.dispatch_job(job).await, Some(1));
        assert_eq!(stream.collect().await.text(), "ab");

        t0.send_replace(SlotState::Running { pid: None });
        let (job, stream) = Job::completion("cd", SamplingParams::default());
        assert_eq!(manager.dispatch_job(job).await, Some(0));
        assert_eq!(stream.collect().await.text(), "cd");

        assert_eq!(fake0.accepts(), 1);
        assert_eq!(fake1.accepts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_on_one_worker_do_not_interleave() {
        let fake = FakeWorker::start(Fault::None);
        let (s0, _t0) = slot(0, WorkerClient::new(0, &fake.path), SlotState::Running { pid: None });
        let manager = Arc::new(WorkerManager::from_slots(vec![s0]));

        // (job index, terminal?) in arrival order across all consumers
        let log = Arc::new(Mutex::new(Vec::new()));
        let prompts = ["aaaa", "bbbb", "cccc"];

        let mut consumers = Vec::new();
        for (idx, prompt) in prompts.into_iter().enumerate() {
            let manager = manager.clone();
            let log = log.clone();
            consumers.push(tokio::spawn(async move {
                let (job, mut stream) = Job::completion(prompt, SamplingParams::default());
                let consume = async {
                    let mut text = String::new();
                    while let Some(event) = stream.next().await {
                        match event {
                            JobEvent::Fragment(fragment) => {
                                log.lock().unwrap().push((idx, false));
                                text.push_str(&fragment);
                            }
                            JobEvent::Done(outcome) => {
                                log.lock().unwrap().push((idx, true));
                                assert!(outcome.is_success());
                            }
                        }
                    }
                    text
                };
                let (dispatched, text) = tokio::join!(manager.dispatch_job(job), consume);
                assert_eq!(dispatched, Some(0));
                assert_eq!(text, prompt);
            }));
        }
        for consumer in consumers {
            consumer.await.unwrap();
        }

        // Each job's events form one run that ends with its terminal event
        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), prompts.len() * 5);
        let mut runs: Vec<(usize, bool)> = Vec::new();
        for (idx, done) in log {
            match runs.last_mut() {
                Some(run) if run.0 == idx => {
                    assert!(!run.1, "job {} produced output after its terminal event", idx);
                    run.1 = done;
                }
                _ => runs.push((idx, done)),
            }
        }
        assert_eq!(runs.len(), prompts.len());
        assert!(runs.iter().all(|(_, done)| *done));
        assert_eq!(fake.accepts(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_waits_while_slot_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (release, released) = oneshot::channel::<()>();

        // Holds the first job open until released, then answers both
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut reader = BufReader::new(r);
            let mut line = String::new();
            let stop = encode_line(&WireResponse::terminal(FinishReason::Stop, None)).unwrap();

            reader.read_line(&mut line).await.unwrap();
            let _ = released.await;
            w.write_all(&stop).await.unwrap();

            line.clear();
            reader.read_line(&mut line).await.unwrap();
            w.write_all(&stop).await.unwrap();

            line.clear();
            let _ = reader.read_line(&mut line).await;
        });

        let (s0, _t0) = slot(0, WorkerClient::new(0, &path), SlotState::Running { pid: None });
        let manager = WorkerManager::from_slots(vec![s0]);

        let (first, first_stream) = Job::completion("one", SamplingParams::default());
        assert_eq!(manager.dispatch_job(first).await, Some(0));

        let (second, second_stream) = Job::completion("two", SamplingParams::default());
        let second = manager.dispatch_job(second);
        tokio::pin!(second);
        assert!(
            tokio::time::timeout(Duration::from_millis(300), &mut second)
                .await
                .is_err(),
            "dispatch returned while the slot was still running a job"
        );

        release.send(()).unwrap();
        assert_eq!(first_stream.collect().await.outcome.reason, FinishReason::Stop);
        assert_eq!(second.await, Some(0));
        assert_eq!(second_stream.collect().await.outcome.reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_wait_for_ready_follows_slot_state() {
        let dir = tempfile::tempdir().unwrap();
        let (s0, t0) = slot(0, WorkerClient::new(0, dir.path().join("0.sock")), SlotState::Starting);
        let (s1, _t1) = slot(1, WorkerClient::new(1, dir.path().join("1.sock")), SlotState::Failed);
        let manager = WorkerManager::from_slots(vec![s0, s1]);

        assert!(!manager.wait_for_ready(Duration::from_millis(50)).await);

        let flip = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            t0.send_replace(SlotState::Running { pid: Some(42) });
            t0
        });
        assert!(manager.wait_for_ready(Duration::from_secs(5)).await);
        assert_eq!(manager.ready_count(), 1);
        drop(flip.await.unwrap());

        assert!(!WorkerManager::from_slots(Vec::new())
            .wait_for_ready(Duration::from_millis(10))
            .await);
    }

    #[tokio::test]
    async fn test_external_mode_marks_slots_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            worker_executable: "/usr/local/bin/llmpool-worker".into(),
            model_path: dir.path().join("model.bin"),
            num_workers: 2,
            threads: 1,
            ctx_size: 512,
            socket_dir: dir.path().to_path_buf(),
            spawn_workers: false,
            ready_probe_interval_ms: 10,
            seed: -1,
            restart: Default::default(),
        };
        let mut manager = WorkerManager::new(config);
        manager.start_workers().unwrap();
        assert!(manager.start_workers().is_err());

        assert_eq!(
            manager.slot_states(),
            vec![SlotState::Running { pid: None }; 2]
        );

        // Nobody is listening: the job reaches slot 0 and fails on dial
        let (job, stream) = Job::tokenize("hello");
        assert_eq!(manager.dispatch_job(job).await, Some(0));
        let output = stream.collect().await;
        assert_eq!(output.outcome.reason, FinishReason::Error);

        manager.shutdown().await;
    }
}
