//! llmpool wire protocol
//!
//! Records exchanged between the coordinator and worker processes. Every
//! record is a single JSON object terminated by `\n`. A request produces zero
//! or more fragment records followed by exactly one terminal record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire kind of a completion job
pub const COMPLETION_JOB: &str = "completion";

/// Wire kind of a tokenize job
pub const TOKENIZE_JOB: &str = "tokenize";

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum WireError {
    /// The record is not valid JSON or does not match the schema
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The request names a job kind this protocol does not know
    #[error("invalid job kind: {0}")]
    InvalidJob(String),

    /// The request is well-formed but cannot be executed
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Why a job stopped producing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishReason {
    /// The engine hit an end-of-text condition
    Stop,

    /// The generation budget was exhausted
    Finish,

    /// The job failed
    Error,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::Stop => "Stop",
            FinishReason::Finish => "Finish",
            FinishReason::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Sampling configuration handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// RNG seed, negative means engine-chosen
    pub seed: i32,

    /// Generation budget in tokens
    pub tokens: u32,

    pub top_k: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,

    /// Window the repeat penalty looks back over
    pub repeat_last_n: i32,

    /// Prompt evaluation batch size
    pub batch_size: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            seed: -1,
            tokens: 128,
            top_k: 40,
            top_p: 0.95,
            temperature: 0.9,
            repeat_penalty: 1.10,
            repeat_last_n: 64,
            batch_size: 8,
        }
    }
}

impl SamplingParams {
    /// Default parameters with the given generation budget
    pub fn with_tokens(tokens: u32) -> Self {
        Self {
            tokens,
            ..Self::default()
        }
    }
}

/// A validated unit of work for a worker
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Generate text continuing `prompt`
    Completion {
        prompt: String,
        params: SamplingParams,
    },

    /// Split `prompt` into engine tokens
    Tokenize { prompt: String },
}

impl Request {
    /// Wire name of this request's job kind
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Completion { .. } => COMPLETION_JOB,
            Request::Tokenize { .. } => TOKENIZE_JOB,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Request::Completion { prompt, .. } | Request::Tokenize { prompt } => prompt,
        }
    }

    /// Reject requests a worker could never satisfy
    pub fn validate(&self) -> Result<(), WireError> {
        if self.prompt().is_empty() {
            return Err(WireError::InvalidRequest("empty prompt".to_string()));
        }
        if let Request::Completion { params, .. } = self {
            if params.tokens == 0 {
                return Err(WireError::InvalidRequest("tokens is zero".to_string()));
            }
        }
        Ok(())
    }
}

/// Request record as it appears on the wire
///
/// `job` stays a plain string here so that a worker can answer an unknown
/// kind with a terminal error instead of dropping the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub job: String,
    pub prompt: String,
    #[serde(default)]
    pub params: SamplingParams,
}

impl From<&Request> for WireRequest {
    fn from(request: &Request) -> Self {
        let params = match request {
            Request::Completion { params, .. } => params.clone(),
            Request::Tokenize { .. } => SamplingParams::default(),
        };
        Self {
            job: request.kind().to_string(),
            prompt: request.prompt().to_string(),
            params,
        }
    }
}

impl TryFrom<WireRequest> for Request {
    type Error = WireError;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        match wire.job.as_str() {
            COMPLETION_JOB => Ok(Request::Completion {
                prompt: wire.prompt,
                params: wire.params,
            }),
            TOKENIZE_JOB => Ok(Request::Tokenize {
                prompt: wire.prompt,
            }),
            _ => Err(WireError::InvalidJob(wire.job)),
        }
    }
}

/// Response record as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    #[serde(default, deserialize_with = "one_or_many")]
    pub text: Vec<String>,

    pub finish: bool,

    /// Empty on fragment records
    #[serde(default, with = "reason_field")]
    pub reason: Option<FinishReason>,

    #[serde(default)]
    pub err: String,
}

impl WireResponse {
    /// Non-terminal record carrying one or more text pieces
    pub fn fragment(text: Vec<String>) -> Self {
        Self {
            text,
            finish: false,
            reason: None,
            err: String::new(),
        }
    }

    /// Terminal record closing a job
    pub fn terminal(reason: FinishReason, err: Option<String>) -> Self {
        Self {
            text: Vec::new(),
            finish: true,
            reason: Some(reason),
            err: err.unwrap_or_default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish
    }

    /// Finish reason of a terminal record; a terminal without one is an error
    pub fn finish_reason(&self) -> FinishReason {
        self.reason.unwrap_or(FinishReason::Error)
    }

    /// Error carried by a terminal record, if any
    pub fn error(&self) -> Option<&str> {
        if self.err.is_empty() {
            None
        } else {
            Some(&self.err)
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// `reason` travels as `""` until the terminal record
mod reason_field {
    use super::FinishReason;
    use serde::de::IntoDeserializer;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(reason: &Option<FinishReason>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match reason {
            Some(reason) => reason.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<FinishReason>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)?.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => {
                let raw: serde::de::value::StrDeserializer<'_, D::Error> = raw.into_deserializer();
                FinishReason::deserialize(raw).map(Some)
            }
        }
    }
}

/// Serialize a record as one newline-terminated line
pub fn encode_line<T: Serialize>(record: &T) -> Result<Vec<u8>, WireError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line (with or without its terminator) into a record
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, WireError> {
    Ok(serde_json::from_str(line.trim_end_matches(['\n', '\r']))?)
}
