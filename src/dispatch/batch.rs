//! Batch coordination: chunking, bounded fan-out, and immediate retries.
//!
//! A batch pass deduplicates the work set by PMID, splits it into chunks,
//! dispatches each chunk concurrently (total in-flight work stays bounded
//! by the selector's global cap), and then makes up to the configured
//! number of additional passes over the still-retryable subset with an
//! exponentially growing, jittered delay between passes. Items that
//! remain unresolved are returned to the caller for durable queueing,
//! never dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, info};

use super::selector::{DispatchOutcome, EndpointSelector};
use crate::executor::RequestExecutor;
use crate::retry::RetryPolicy;
use crate::work::{
    BatchOptions, BatchProgress, ItemFailure, ItemSuccess, SearchContext, WorkItem,
};

/// Outcome of one coordinator pass over a work set.
///
/// The service layer converts this into the public
/// [`crate::work::BatchResult`] after handing `unresolved` to the durable
/// retry queue.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Items resolved with a result.
    pub successes: Vec<ItemSuccess>,
    /// Items that failed terminally (non-retryable classification).
    pub failures: Vec<ItemFailure>,
    /// PMIDs dropped as duplicates within the submitted set.
    pub duplicates: Vec<String>,
    /// Items still unresolved after every immediate pass.
    pub unresolved: Vec<WorkItem>,
    /// Wall-clock duration of all passes.
    pub duration: std::time::Duration,
    /// Whether at least one request was actually issued. False means
    /// every pass found the whole pool unavailable.
    pub issued_any: bool,
}

/// Coordinates batch processing with bounded concurrency and layered
/// immediate retries.
pub struct BatchCoordinator {
    selector: Arc<EndpointSelector>,
    executor: Arc<RequestExecutor>,
    policy: RetryPolicy,
    chunk_size: usize,
    max_chunk_size: usize,
}

impl BatchCoordinator {
    /// Creates a coordinator with the given chunking and retry policy.
    pub fn new(
        selector: Arc<EndpointSelector>,
        executor: Arc<RequestExecutor>,
        policy: RetryPolicy,
        chunk_size: usize,
        max_chunk_size: usize,
    ) -> Self {
        Self {
            selector,
            executor,
            policy,
            chunk_size,
            max_chunk_size,
        }
    }

    /// Processes a work set to completion of the immediate phase.
    ///
    /// Every submitted item ends up in exactly one of the summary's
    /// buckets: `successes`, `failures`, `duplicates`, or `unresolved`.
    pub async fn process(
        &self,
        items: Vec<WorkItem>,
        context: &SearchContext,
        options: &BatchOptions,
    ) -> BatchSummary {
        let start = Instant::now();
        let mut summary = BatchSummary::default();

        // Deduplicate by PMID, preserving first occurrence order
        let mut seen = HashSet::new();
        let mut pending: Vec<WorkItem> = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.pmid.clone()) {
                pending.push(item);
            } else {
                summary.duplicates.push(item.pmid);
            }
        }

        let chunk_size = options
            .batch_size
            .unwrap_or(self.chunk_size)
            .min(self.max_chunk_size)
            .max(1);
        let max_retries = options
            .max_immediate_retries
            .unwrap_or(self.policy.max_retries);
        let total_items = pending.len();

        info!(
            items = total_items,
            duplicates = summary.duplicates.len(),
            chunk_size = chunk_size,
            "Batch processing started"
        );

        let mut pass: u32 = 1;
        let mut dispatched: usize = 0;

        while !pending.is_empty() {
            if pass > 1 {
                let retry_number = pass - 1;
                if retry_number > max_retries {
                    break;
                }
                let delay = self.policy.delay(retry_number);
                debug!(
                    pass = pass,
                    pending = pending.len(),
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before retry pass"
                );
                tokio::time::sleep(delay).await;
            }

            let current = std::mem::take(&mut pending);
            let total_chunks = current.len().div_ceil(chunk_size);

            for (chunk_index, chunk) in current.chunks(chunk_size).enumerate() {
                let outcomes = join_all(chunk.iter().map(|item| {
                    let selector = Arc::clone(&self.selector);
                    let executor = Arc::clone(&self.executor);
                    async move {
                        let outcome = selector.dispatch(&executor, item, context).await;
                        (item.clone(), outcome)
                    }
                }))
                .await;

                dispatched += outcomes.len();

                for (item, outcome) in outcomes {
                    match outcome {
                        DispatchOutcome::Success {
                            result,
                            endpoint,
                            latency_ms,
                        } => {
                            summary.issued_any = true;
                            crate::metrics::record_item("success");
                            summary.successes.push(ItemSuccess {
                                pmid: item.pmid,
                                result,
                                attempt: pass,
                                endpoint,
                                latency_ms,
                            });
                        }
                        DispatchOutcome::Fatal(error) => {
                            summary.issued_any = true;
                            crate::metrics::record_item("terminal_failure");
                            summary.failures.push(ItemFailure {
                                status: error.status(),
                                error: error.to_string(),
                                pmid: item.pmid,
                            });
                        }
                        DispatchOutcome::Retryable(_) => {
                            summary.issued_any = true;
                            pending.push(item);
                        }
                        DispatchOutcome::Unavailable => {
                            pending.push(item);
                        }
                    }
                }

                if let Some(progress) = &options.progress {
                    progress(BatchProgress {
                        chunk_index,
                        total_chunks,
                        processed: dispatched,
                        succeeded: summary.successes.len(),
                        failed: summary.failures.len(),
                    });
                }
            }

            debug!(
                pass = pass,
                resolved = summary.successes.len(),
                terminal = summary.failures.len(),
                remaining = pending.len(),
                "Batch pass complete"
            );
            pass += 1;
        }

        summary.unresolved = pending;
        summary.duration = start.elapsed();

        info!(
            items = total_items,
            succeeded = summary.successes.len(),
            failed = summary.failures.len(),
            unresolved = summary.unresolved.len(),
            duration_ms = summary.duration.as_millis() as u64,
            "Batch processing finished"
        );

        summary
    }
}
