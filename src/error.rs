//! Error types for inferelay operations.
//!
//! Defines error types for the major subsystems:
//! - Single-attempt fetch failures and their retry classification
//! - Batch-level dispatch failures
//! - Durable retry queue operations

use thiserror::Error;
use uuid::Uuid;

/// Errors from a single inference attempt against one endpoint.
///
/// The variant determines retry classification: connection problems,
/// timeouts, server errors and undecodable bodies are retryable against
/// another endpoint (or later against the same one); client errors are
/// terminal for the item.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Server error (HTTP {status})")]
    Server { status: u16 },

    #[error("Client error (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    #[error("Response body is not valid JSON: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether this failure may succeed on another attempt.
    ///
    /// 4xx responses are the only non-retryable class: the request itself
    /// is rejected and no endpoint will accept it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Client { .. })
    }

    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Server { status } | FetchError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short outcome label used in logs and metric labels.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            FetchError::Connection(_) => "connection_error",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Server { .. } => "server_error",
            FetchError::Client { .. } => "client_error",
            FetchError::Decode(_) => "decode_error",
        }
    }
}

/// Errors raised to callers of the batch coordinator.
///
/// Per-item failures never surface here; they are collected into the
/// [`crate::work::BatchResult`]. Only conditions that prevent the batch
/// from making progress at all are errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every endpoint is either circuit-open or at its concurrency cap.
    #[error("No endpoints available: all circuits open or at capacity")]
    NoEndpointsAvailable,

    /// The service is shutting down and no longer accepts work.
    #[error("Dispatch service is shut down")]
    ShutDown,

    /// Unexpected internal failure inside the coordinator.
    #[error("Internal dispatch error: {0}")]
    Internal(String),
}

/// Errors from the durable retry queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Retry job {0} not found")]
    JobNotFound(Uuid),

    #[error("Retry job {0} is already being processed")]
    JobBusy(Uuid),

    #[error("Retry queue is shut down")]
    ShutDown,
}
