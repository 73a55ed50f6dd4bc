//! Durable retry job records.
//!
//! A `RetryJob` is created when a batch exhausts its immediate retry
//! budget with items still unresolved. The in-memory copy is
//! authoritative for processing; the durable mirror exists for audit and
//! crash recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::work::{SearchContext, WorkItem};

/// Lifecycle status of a retry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryJobStatus {
    /// Waiting for the next background pass.
    Pending,
    /// A background pass is currently running.
    Processing,
    /// Every item resolved; the job is about to be discarded.
    Completed,
    /// Retry budget or give-up horizon exhausted; terminal failure.
    Abandoned,
}

impl std::fmt::Display for RetryJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryJobStatus::Pending => write!(f, "pending"),
            RetryJobStatus::Processing => write!(f, "processing"),
            RetryJobStatus::Completed => write!(f, "completed"),
            RetryJobStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Items that survived immediate retries, awaiting background redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryJob {
    /// Unique identifier for this job.
    pub job_id: Uuid,
    /// Items still unresolved.
    pub items: Vec<WorkItem>,
    /// Search context the items were submitted under.
    pub context: SearchContext,
    /// Background passes already attempted.
    pub retry_count: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the last background pass ran.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    pub status: RetryJobStatus,
}

impl RetryJob {
    /// Creates a pending job for the given unresolved items.
    pub fn new(items: Vec<WorkItem>, context: SearchContext) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            items,
            context,
            retry_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            status: RetryJobStatus::Pending,
        }
    }

    /// PMIDs of the remaining items.
    pub fn pmids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.pmid.clone()).collect()
    }

    /// How long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Whether the job has exhausted its budget or horizon and must be
    /// abandoned instead of retried.
    pub fn should_abandon(&self, max_retries: u32, give_up_after: Duration) -> bool {
        if self.retry_count >= max_retries {
            return true;
        }
        self.age().num_seconds() >= give_up_after.as_secs() as i64
    }

    /// Drops items whose PMID appears in `resolved`. Returns how many
    /// were removed.
    pub fn remove_resolved(&mut self, resolved: &HashSet<String>) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !resolved.contains(&item.pmid));
        before - self.items.len()
    }

    /// Whether every item has been resolved.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
