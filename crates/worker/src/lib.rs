//! llmpool Worker
//!
//! Hosts a single inference engine inside its own OS process. Every engine
//! call is serialized through one execution thread, while any number of IPC
//! connections may submit jobs concurrently.

pub mod echo;
pub mod engine;
pub mod executor;
pub mod fragment;
pub mod ipc;

pub use echo::EchoEngine;
pub use engine::{Engine, EngineError};
pub use executor::{run_job, Executor};
pub use fragment::FragmentBuffer;
pub use ipc::WorkerServer;
