//! Durable storage for the retry queue.
//!
//! The filesystem is the durable mirror: one JSON file per retry job in
//! a spool directory, plus an append-only JSONL audit log of abandoned
//! jobs. The mirror is best-effort for active processing and
//! authoritative only for crash recovery and the abandonment audit
//! trail.

pub mod jobs;

pub use jobs::{AbandonRecord, JobStore, StorageError};
