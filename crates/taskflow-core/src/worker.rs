use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::models::{Payload, TaskRecord, WorkerKind};

pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<Payload, WorkerError>> + Send>>;

/// External unit of work invoked by the orchestrator for one stage attempt.
///
/// A worker that never resolves is handled by the task timeout; its late
/// result is discarded.
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    fn execute(&self, task: TaskRecord) -> WorkerFuture;
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
    pub stack: Option<String>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Adapts an async closure into a [`Worker`].
pub struct FnWorker<F> {
    kind: WorkerKind,
    handler: F,
}

impl<F> FnWorker<F> {
    pub fn new(kind: WorkerKind, handler: F) -> Self {
        Self { kind, handler }
    }
}

impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, WorkerError>> + Send + 'static,
{
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    fn execute(&self, task: TaskRecord) -> WorkerFuture {
        Box::pin((self.handler)(task))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UsageEstimate {
    pub tokens: u64,
    pub cost: f64,
}

/// Derives token usage and cost for a completed stage from its output.
pub trait CostModel: Send + Sync {
    fn estimate(&self, output: &Payload) -> UsageEstimate;
}

pub const DEFAULT_BYTES_PER_TOKEN: u64 = 4;
pub const DEFAULT_COST_PER_THOUSAND_TOKENS: f64 = 0.002;

/// Estimates tokens from the serialized output size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SizeCostModel {
    pub bytes_per_token: u64,
    pub cost_per_thousand_tokens: f64,
}

impl Default for SizeCostModel {
    fn default() -> Self {
        Self {
            bytes_per_token: DEFAULT_BYTES_PER_TOKEN,
            cost_per_thousand_tokens: DEFAULT_COST_PER_THOUSAND_TOKENS,
        }
    }
}

impl CostModel for SizeCostModel {
    fn estimate(&self, output: &Payload) -> UsageEstimate {
        let bytes = output.encoded_len() as u64;
        let tokens = bytes.div_ceil(self.bytes_per_token.max(1));
        UsageEstimate {
            tokens,
            cost: tokens as f64 / 1000.0 * self.cost_per_thousand_tokens,
        }
    }
}
