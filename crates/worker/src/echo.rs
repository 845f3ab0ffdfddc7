//! Development engine
//!
//! Stands in for a native backend so the worker binary can run end to end.
//! It echoes the prompt back one byte at a time, which also exercises the
//! UTF-8 fragment buffering on every multi-byte character.

use crate::engine::{Engine, EngineError};
use llmpool_proto::{FinishReason, SamplingParams};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct EchoEngine {
    model_path: PathBuf,
    threads: usize,
    ctx_size: usize,
    loaded: bool,
}

impl EchoEngine {
    pub fn new(model_path: impl Into<PathBuf>, threads: usize, ctx_size: usize) -> Self {
        Self {
            model_path: model_path.into(),
            threads,
            ctx_size,
            loaded: false,
        }
    }
}

impl Engine for EchoEngine {
    fn load(&mut self) -> Result<(), EngineError> {
        let meta = std::fs::metadata(&self.model_path).map_err(|e| {
            EngineError(format!("cannot open model {}: {}", self.model_path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(EngineError(format!(
                "model path {} is not a file",
                self.model_path.display()
            )));
        }

        info!(
            "Loaded model {} ({} threads, context {})",
            self.model_path.display(),
            self.threads,
            self.ctx_size
        );
        self.loaded = true;
        Ok(())
    }

    fn predict(
        &mut self,
        params: &SamplingParams,
        prompt: &str,
        on_piece: &mut dyn FnMut(&[u8]),
    ) -> Result<FinishReason, EngineError> {
        if !self.loaded {
            return Err(EngineError::new("model not loaded"));
        }

        let budget = params.tokens as usize;
        for (emitted, ch) in prompt.chars().enumerate() {
            if emitted == budget {
                return Ok(FinishReason::Finish);
            }
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).as_bytes() {
                on_piece(std::slice::from_ref(byte));
            }
        }

        if prompt.chars().count() >= budget {
            Ok(FinishReason::Finish)
        } else {
            Ok(FinishReason::Stop)
        }
    }

    fn tokenize_prompt(&mut self, prompt: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();

        for ch in prompt.chars() {
            if ch.is_whitespace() && !current.trim().is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() {
            tokens.push(current);
        }

        tokens
    }
}
