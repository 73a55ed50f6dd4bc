//! inferelay: resilient dispatch layer for slow literature-inference endpoints.
//!
//! This library fans PMID-identified work items out to a pool of
//! interchangeable remote inference endpoints, tracking per-endpoint health
//! with a circuit breaker, bounding concurrency globally and per endpoint,
//! and guaranteeing that every submitted item reaches a terminal state
//! through a layered retry pipeline backed by a durable queue.

// Core modules
pub mod backend;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod retry;
pub mod service;
pub mod storage;
pub mod work;

// Re-export commonly used types
pub use config::{ConfigError, DispatchConfig};
pub use error::{DispatchError, FetchError, QueueError};
pub use service::DispatchService;
pub use work::{BatchOptions, BatchResult, SearchContext, WorkItem};
