//! Streaming job abstraction
//!
//! A job is split into two halves. [`Job`] is the producer: it travels to
//! whichever component executes the work and is the only way to emit
//! fragments or complete the job. [`JobStream`] is the consumer held by the
//! caller. The stream yields fragments in production order followed by
//! exactly one [`JobEvent::Done`].

use llmpool_proto::{FinishReason, Request, SamplingParams};
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Fragments buffered between producer and consumer
const FRAGMENT_BUFFER: usize = 128;

/// Terminal state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub reason: FinishReason,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn new(reason: FinishReason, error: Option<String>) -> Self {
        Self { reason, error }
    }

    /// Outcome of a job that failed before or during execution
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            reason: FinishReason::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason != FinishReason::Error && self.error.is_none()
    }
}

/// One item of a job's output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Fragment(String),
    Done(JobOutcome),
}

/// Producer half of a job
pub struct Job {
    id: Uuid,
    request: Request,
    fragments: mpsc::Sender<String>,
    outcome: Option<oneshot::Sender<JobOutcome>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.request.kind())
            .finish()
    }
}

impl Job {
    /// Create a job and the stream its output will arrive on
    pub fn new(request: Request) -> (Job, JobStream) {
        let id = Uuid::new_v4();
        let (fragments_tx, fragments_rx) = mpsc::channel(FRAGMENT_BUFFER);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let job = Job {
            id,
            request,
            fragments: fragments_tx,
            outcome: Some(outcome_tx),
        };
        let stream = JobStream {
            id,
            fragments: fragments_rx,
            outcome: Some(outcome_rx),
        };
        (job, stream)
    }

    pub fn completion(prompt: impl Into<String>, params: SamplingParams) -> (Job, JobStream) {
        Job::new(Request::Completion {
            prompt: prompt.into(),
            params,
        })
    }

    pub fn tokenize(prompt: impl Into<String>) -> (Job, JobStream) {
        Job::new(Request::Tokenize {
            prompt: prompt.into(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Append a fragment to the stream.
    ///
    /// Waits while the consumer is behind. Once the consumer is gone the
    /// fragment is discarded.
    pub async fn push(&self, text: String) {
        let _ = self.fragments.send(text).await;
    }

    /// Complete the job. Consumes the producer, so it can only happen once.
    pub fn finish(mut self, reason: FinishReason, error: Option<String>) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(JobOutcome::new(reason, error));
        }
    }

    /// Complete the job with `Reason=Error`
    pub fn fail(self, error: impl fmt::Display) {
        self.finish(FinishReason::Error, Some(error.to_string()));
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(JobOutcome::failed("job dropped before completion"));
        }
    }
}

/// Consumer half of a job
#[derive(Debug)]
pub struct JobStream {
    id: Uuid,
    fragments: mpsc::Receiver<String>,
    outcome: Option<oneshot::Receiver<JobOutcome>>,
}

/// Everything a job produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub fragments: Vec<String>,
    pub outcome: JobOutcome,
}

impl JobOutput {
    /// Concatenated fragment text
    pub fn text(&self) -> String {
        self.fragments.concat()
    }
}

impl JobStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next fragment, then the outcome, then `None` forever
    pub async fn next(&mut self) -> Option<JobEvent> {
        if let Some(text) = self.fragments.recv().await {
            return Some(JobEvent::Fragment(text));
        }

        let outcome = self.outcome.take()?;
        let outcome = outcome
            .await
            .unwrap_or_else(|_| JobOutcome::failed("job dropped before completion"));
        Some(JobEvent::Done(outcome))
    }

    /// Drain the stream
    pub async fn collect(mut self) -> JobOutput {
        let mut fragments = Vec::new();
        loop {
            match self.next().await {
                Some(JobEvent::Fragment(text)) => fragments.push(text),
                Some(JobEvent::Done(outcome)) => return JobOutput { fragments, outcome },
                None => {
                    return JobOutput {
                        fragments,
                        outcome: JobOutcome::failed("job stream already drained"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fragments_then_single_outcome() {
        let (job, mut stream) = Job::completion("Hi", SamplingParams::default());
        assert_eq!(job.id(), stream.id());

        job.push("He".to_string()).await;
        job.push("llo".to_string()).await;
        job.finish(FinishReason::Finish, None);

        assert_eq!(stream.next().await, Some(JobEvent::Fragment("He".to_string())));
        assert_eq!(stream.next().await, Some(JobEvent::Fragment("llo".to_string())));
        assert_eq!(
            stream.next().await,
            Some(JobEvent::Done(JobOutcome::new(FinishReason::Finish, None)))
        );
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_dropped_job_resolves_with_error() {
        let (job, stream) = Job::tokenize("hello");
        job.push("hello".to_string()).await;
        drop(job);

        let output = stream.collect().await;
        assert_eq!(output.fragments, vec!["hello".to_string()]);
        assert_eq!(output.outcome.reason, FinishReason::Error);
        assert_eq!(output.outcome.error.as_deref(), Some("job dropped before completion"));
    }

    #[tokio::test]
    async fn test_abandoned_stream_does_not_block_producer() {
        let (job, stream) = Job::completion("Hi", SamplingParams::default());
        drop(stream);

        for i in 0..(FRAGMENT_BUFFER * 2) {
            job.push(i.to_string()).await;
        }
        job.fail("late");
    }

    #[tokio::test]
    async fn test_collect_concatenates() {
        let (job, stream) = Job::completion("Hi", SamplingParams::default());
        let producer = tokio::spawn(async move {
            job.push("partial".to_string()).await;
            job.fail("someErr");
        });

        let output = stream.collect().await;
        producer.await.unwrap();
        assert_eq!(output.text(), "partial");
        assert!(!output.outcome.is_success());
        assert_eq!(output.outcome.error.as_deref(), Some("someErr"));
    }
}
