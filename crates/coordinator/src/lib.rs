//! llmpool Coordinator
//!
//! Supervises a fixed pool of worker processes and routes streaming jobs to
//! them over their IPC sockets.

pub mod job;
pub mod manager;
pub mod supervisor;
pub mod worker_client;

pub use job::{Job, JobEvent, JobOutcome, JobOutput, JobStream};
pub use manager::{WorkerManager, WorkerSlot, NO_AVAILABLE_WORKER};
pub use supervisor::{SlotState, Supervisor};
pub use worker_client::{WorkerClient, WorkerHandle};
