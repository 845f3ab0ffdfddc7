//! Unix-socket IPC between the coordinator and this worker

pub mod server;

pub use server::WorkerServer;
