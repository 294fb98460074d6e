//! The single capability every external collaborator exposes.
//!
//! Workers differ only in what they compute and how they are reached; the
//! integration manager picks the transport, the worker just answers requests.

use crate::error::ErrorKind;
use crate::resilience::Classify;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One call to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub target_id: String,
    pub payload: Value,
    pub timeout: Duration,
    pub correlation_id: String,
    /// 1-based attempt number within the current invocation
    pub attempt: u32,
}

/// Failure reported by a worker, classified by the worker itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Timeout, connection failure, 5xx-equivalent
    #[error("Transient worker failure: {message}")]
    Transient { message: String },

    /// Validation failure, 4xx-equivalent
    #[error("Permanent worker failure: {message}")]
    Permanent { message: String },

    /// Worker-side resource exhaustion
    #[error("Worker system failure: {message}")]
    System { message: String },
}

impl WorkerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } | Self::System { message } => {
                message
            }
        }
    }
}

impl Classify for WorkerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Permanent { .. } => ErrorKind::Permanent,
            Self::System { .. } => ErrorKind::System,
        }
    }
}

/// Polymorphic worker capability
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, WorkerError>;

    /// Streamed variant; defaults to a single chunk produced by [`Worker::invoke`]
    fn invoke_stream(&self, request: InvocationRequest) -> BoxStream<'_, Result<Value, WorkerError>> {
        stream::once(self.invoke(request)).boxed()
    }
}

/// Adapts a closure into a [`Worker`]
pub struct FnWorker<F> {
    handler: F,
}

impl<F, Fut> FnWorker<F>
where
    F: Fn(InvocationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkerError>> + Send + 'static,
{
    pub fn new(handler: F) -> Arc<Self> {
        Arc::new(Self { handler })
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(InvocationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkerError>> + Send + 'static,
{
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, WorkerError> {
        (self.handler)(request).await
    }
}
