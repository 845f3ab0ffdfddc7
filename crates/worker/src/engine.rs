//! Inference engine interface
//!
//! The worker drives exactly one engine instance. Engines are not reentrant:
//! the executor guarantees that at most one call is in flight at a time.

use llmpool_proto::{FinishReason, SamplingParams};
use thiserror::Error;

/// Failure reported by an engine
///
/// The message is forwarded verbatim as the `err` of the job's terminal
/// record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        EngineError(msg.into())
    }
}

/// Text generation backend hosted by a worker process
pub trait Engine: Send + 'static {
    /// Load model state. Called once before any other method.
    fn load(&mut self) -> Result<(), EngineError>;

    /// Generate text continuing `prompt`.
    ///
    /// `on_piece` is invoked synchronously zero or more times before the call
    /// returns. A piece is raw bytes and may end in the middle of a multi-byte
    /// character.
    fn predict(
        &mut self,
        params: &SamplingParams,
        prompt: &str,
        on_piece: &mut dyn FnMut(&[u8]),
    ) -> Result<FinishReason, EngineError>;

    /// Split `prompt` into the engine's token strings, in order
    fn tokenize_prompt(&mut self, prompt: &str) -> Vec<String>;
}
