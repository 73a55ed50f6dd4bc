//! Durable background retry queue.
//!
//! Items that survive a batch's immediate retries land here as
//! [`RetryJob`]s. A periodic sweep reprocesses pending jobs through the
//! same batch mechanism with a smaller chunk size, until every item
//! resolves or the job hits its retry budget or give-up horizon and is
//! abandoned. Abandonment is the one outcome that must survive a crash:
//! it is logged and appended to the durable audit trail with the full
//! item list for operator follow-up.
//!
//! The in-memory job map is authoritative; the file store is a
//! best-effort mirror whose write failures never abort processing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::job::{RetryJob, RetryJobStatus};
use crate::config::DispatchConfig;
use crate::dispatch::BatchCoordinator;
use crate::error::QueueError;
use crate::storage::{AbandonRecord, JobStore};
use crate::work::{BatchOptions, QueuedRemainder, SearchContext, WorkItem};

/// Outcome of one background pass over one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPassOutcome {
    /// Every remaining item resolved; the job is gone.
    Completed { recovered: usize },
    /// Some items resolved; the job stays pending.
    Remaining { recovered: usize, remaining: usize },
    /// Budget or horizon exhausted; the job was abandoned.
    Abandoned { item_count: usize },
}

/// Report returned by the manual retry trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualRetryReport {
    /// Whether the job completed as a result of this pass.
    pub success: bool,
    /// Items still unresolved after the pass.
    pub remaining_items: usize,
}

/// Cumulative queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_abandoned: u64,
    /// Items resolved by background passes.
    pub items_recovered: u64,
    /// Items that failed terminally during background passes.
    pub items_failed: u64,
    /// Items lost to abandoned jobs.
    pub items_abandoned: u64,
}

/// Shared atomic counters behind [`QueueStats`].
#[derive(Debug, Default)]
struct SharedQueueStats {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_abandoned: AtomicU64,
    items_recovered: AtomicU64,
    items_failed: AtomicU64,
    items_abandoned: AtomicU64,
}

impl SharedQueueStats {
    fn to_stats(&self) -> QueueStats {
        QueueStats {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::SeqCst),
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_abandoned: self.jobs_abandoned.load(Ordering::SeqCst),
            items_recovered: self.items_recovered.load(Ordering::SeqCst),
            items_failed: self.items_failed.load(Ordering::SeqCst),
            items_abandoned: self.items_abandoned.load(Ordering::SeqCst),
        }
    }
}

/// Read-only summary of one active job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryJobSummary {
    pub job_id: Uuid,
    pub pmids: Vec<String>,
    pub retry_count: u32,
    pub status: RetryJobStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Queue status returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active_jobs: Vec<RetryJobSummary>,
    pub stats: QueueStats,
}

/// The durable retry queue.
pub struct RetryQueue {
    jobs: Mutex<HashMap<Uuid, RetryJob>>,
    store: Arc<JobStore>,
    coordinator: Arc<BatchCoordinator>,
    retry_batch_size: usize,
    max_background_retries: u32,
    give_up_after: Duration,
    sweep_interval: Duration,
    stats: SharedQueueStats,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RetryQueue {
    /// Creates a queue over the given coordinator and store.
    pub fn new(
        coordinator: Arc<BatchCoordinator>,
        store: Arc<JobStore>,
        config: &DispatchConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            coordinator,
            retry_batch_size: config.retry_batch_size,
            max_background_retries: config.max_background_retries,
            give_up_after: config.give_up_after,
            sweep_interval: config.retry_sweep_interval,
            stats: SharedQueueStats::default(),
            shutdown_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Reloads pending jobs from the durable mirror after a restart.
    ///
    /// Returns the number of jobs recovered.
    pub async fn recover(&self) -> usize {
        let loaded = match self.store.load_pending().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to recover retry jobs from spool");
                return 0;
            }
        };

        let mut jobs = self.lock_jobs();
        let mut recovered = 0;
        for job in loaded {
            if !jobs.contains_key(&job.job_id) {
                jobs.insert(job.job_id, job);
                recovered += 1;
            }
        }
        let depth = jobs.len();
        drop(jobs);

        crate::metrics::set_queue_depth(depth);
        if recovered > 0 {
            info!(recovered = recovered, "Recovered retry jobs from spool");
        }
        recovered
    }

    /// Enqueues unresolved items as a new retry job.
    pub async fn enqueue(&self, items: Vec<WorkItem>, context: SearchContext) -> QueuedRemainder {
        let job = RetryJob::new(items, context);
        let remainder = QueuedRemainder {
            job_id: job.job_id,
            pmids: job.pmids(),
        };

        info!(
            job_id = %job.job_id,
            items = job.items.len(),
            "Items queued for background retry"
        );

        let snapshot = job.clone();
        let depth = {
            let mut jobs = self.lock_jobs();
            jobs.insert(job.job_id, job);
            jobs.len()
        };

        self.stats.jobs_enqueued.fetch_add(1, Ordering::SeqCst);
        crate::metrics::set_queue_depth(depth);

        // Best-effort mirror; a write failure must not abort processing
        if let Err(e) = self.store.persist(&snapshot).await {
            warn!(job_id = %snapshot.job_id, error = %e, "Failed to mirror retry job");
        }

        remainder
    }

    /// Starts the periodic background sweep.
    pub fn start(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick; freshly queued jobs should
            // wait a full interval before their first background pass
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.sweep().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Retry queue sweeper received shutdown signal");
                        break;
                    }
                }
            }
        });

        *self.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// One sweep over every pending job.
    pub async fn sweep(&self) {
        let pending: Vec<Uuid> = {
            let jobs = self.lock_jobs();
            jobs.values()
                .filter(|j| j.status == RetryJobStatus::Pending)
                .map(|j| j.job_id)
                .collect()
        };

        if pending.is_empty() {
            return;
        }

        info!(jobs = pending.len(), "Background retry sweep started");

        // Jobs are processed sequentially; the point of the background
        // path is to drain stragglers without competing with live traffic
        for job_id in pending {
            match self.run_job(job_id).await {
                Ok(outcome) => {
                    info!(job_id = %job_id, outcome = ?outcome, "Background pass finished");
                }
                Err(QueueError::JobNotFound(_)) | Err(QueueError::JobBusy(_)) => {}
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Background pass failed");
                }
            }
        }
    }

    /// Forces an immediate background pass for one job, bypassing the
    /// sweep interval but not the endpoint concurrency or circuit rules.
    pub async fn manual_retry(&self, job_id: Uuid) -> Result<ManualRetryReport, QueueError> {
        let outcome = self.run_job(job_id).await?;
        Ok(match outcome {
            JobPassOutcome::Completed { .. } => ManualRetryReport {
                success: true,
                remaining_items: 0,
            },
            JobPassOutcome::Remaining { remaining, .. } => ManualRetryReport {
                success: false,
                remaining_items: remaining,
            },
            JobPassOutcome::Abandoned { item_count } => ManualRetryReport {
                success: false,
                remaining_items: item_count,
            },
        })
    }

    /// Runs one background pass for one job.
    async fn run_job(&self, job_id: Uuid) -> Result<JobPassOutcome, QueueError> {
        // Claim the job or pull it out for abandonment, under the lock
        enum Claim {
            Abandon(RetryJob),
            Run(Vec<WorkItem>, SearchContext),
        }

        let claim = {
            let mut jobs = self.lock_jobs();
            let job = jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;

            if job.status == RetryJobStatus::Processing {
                return Err(QueueError::JobBusy(job_id));
            }

            if job.should_abandon(self.max_background_retries, self.give_up_after) {
                let mut job = jobs.remove(&job_id).expect("job present under lock");
                job.status = RetryJobStatus::Abandoned;
                crate::metrics::set_queue_depth(jobs.len());
                Claim::Abandon(job)
            } else {
                job.status = RetryJobStatus::Processing;
                Claim::Run(job.items.clone(), job.context.clone())
            }
        };

        let (items, context) = match claim {
            Claim::Abandon(job) => {
                let item_count = job.items.len();
                self.finish_abandon(job).await;
                return Ok(JobPassOutcome::Abandoned { item_count });
            }
            Claim::Run(items, context) => (items, context),
        };

        // Reprocess outside the lock with the smaller background chunk
        // size and a single extra pass per attempt
        let options = BatchOptions::new()
            .with_batch_size(self.retry_batch_size)
            .with_max_immediate_retries(1);
        let summary = self.coordinator.process(items, &context, &options).await;

        let resolved: HashSet<String> = summary
            .successes
            .iter()
            .map(|s| s.pmid.clone())
            .chain(summary.failures.iter().map(|f| f.pmid.clone()))
            .collect();
        let recovered = summary.successes.len();
        let failed = summary.failures.len();

        self.stats
            .items_recovered
            .fetch_add(recovered as u64, Ordering::SeqCst);
        self.stats
            .items_failed
            .fetch_add(failed as u64, Ordering::SeqCst);

        for failure in &summary.failures {
            warn!(
                job_id = %job_id,
                pmid = %failure.pmid,
                error = %failure.error,
                "Item failed terminally during background retry"
            );
        }

        // Fold the pass back into the job under the lock
        let (completed, snapshot, remaining, depth) = {
            let mut jobs = self.lock_jobs();
            let job = jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;

            job.retry_count += 1;
            job.last_attempt_at = Some(Utc::now());
            job.remove_resolved(&resolved);

            if job.is_empty() {
                jobs.remove(&job_id);
                (true, None, 0, jobs.len())
            } else {
                job.status = RetryJobStatus::Pending;
                let remaining = job.items.len();
                (false, Some(job.clone()), remaining, jobs.len())
            }
        };

        crate::metrics::set_queue_depth(depth);

        if completed {
            self.stats.jobs_completed.fetch_add(1, Ordering::SeqCst);
            info!(job_id = %job_id, recovered = recovered, "Retry job completed");
            if let Err(e) = self.store.remove(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to remove completed job mirror");
            }
            Ok(JobPassOutcome::Completed { recovered })
        } else {
            let snapshot = snapshot.expect("non-empty job has snapshot");
            if let Err(e) = self.store.persist(&snapshot).await {
                warn!(job_id = %job_id, error = %e, "Failed to mirror retry job");
            }
            Ok(JobPassOutcome::Remaining {
                recovered,
                remaining,
            })
        }
    }

    /// Records an abandoned job: terminal log line, durable audit entry,
    /// statistics, mirror cleanup.
    async fn finish_abandon(&self, job: RetryJob) {
        let pmids = job.pmids();
        let reason = if job.retry_count >= self.max_background_retries {
            format!("retry budget exhausted after {} attempts", job.retry_count)
        } else {
            format!("give-up horizon reached after {}h", job.age().num_hours())
        };

        error!(
            job_id = %job.job_id,
            items = pmids.len(),
            pmids = %pmids.join(","),
            reason = %reason,
            "Retry job abandoned; items require manual follow-up"
        );

        self.stats.jobs_abandoned.fetch_add(1, Ordering::SeqCst);
        self.stats
            .items_abandoned
            .fetch_add(pmids.len() as u64, Ordering::SeqCst);
        crate::metrics::record_items("abandoned", pmids.len());

        let record = AbandonRecord {
            job_id: job.job_id,
            pmids,
            reason,
            retry_count: job.retry_count,
            created_at: job.created_at,
            abandoned_at: Utc::now(),
        };

        // The audit trail is the one durable record of a permanent
        // failure; a write failure here is itself operator-visible
        if let Err(e) = self.store.append_abandoned(&record).await {
            error!(job_id = %record.job_id, error = %e, "Failed to write abandonment audit record");
        }

        if let Err(e) = self.store.remove(record.job_id).await {
            warn!(job_id = %record.job_id, error = %e, "Failed to remove abandoned job mirror");
        }
    }

    /// Current queue status: active jobs and cumulative statistics.
    pub fn status(&self) -> QueueStatus {
        let jobs = self.lock_jobs();
        let mut active_jobs: Vec<RetryJobSummary> = jobs
            .values()
            .map(|job| RetryJobSummary {
                job_id: job.job_id,
                pmids: job.pmids(),
                retry_count: job.retry_count,
                status: job.status,
                created_at: job.created_at,
                last_attempt_at: job.last_attempt_at,
            })
            .collect();
        active_jobs.sort_by_key(|j| j.created_at);

        QueueStatus {
            active_jobs,
            stats: self.stats.to_stats(),
        }
    }

    /// Number of jobs currently held.
    pub fn active_job_count(&self) -> usize {
        self.lock_jobs().len()
    }

    /// Stops the sweeper and persists every held job.
    pub async fn stop(&self) {
        // Ignore send error - the sweeper may have already stopped
        let _ = self.shutdown_tx.send(());

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Retry queue sweeper panicked");
            }
        }

        // Drain in-memory state to the mirror so a restart can resume
        let snapshot: Vec<RetryJob> = {
            let mut jobs = self.lock_jobs();
            jobs.values_mut()
                .map(|job| {
                    if job.status == RetryJobStatus::Processing {
                        job.status = RetryJobStatus::Pending;
                    }
                    job.clone()
                })
                .collect()
        };

        for job in snapshot {
            if let Err(e) = self.store.persist(&job).await {
                warn!(job_id = %job.job_id, error = %e, "Failed to persist job during shutdown");
            }
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RetryJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
