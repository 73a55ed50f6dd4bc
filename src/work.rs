//! Work item and batch result types.
//!
//! This module defines the core value types flowing through the dispatch
//! layer:
//!
//! - `WorkItem`: one literature record requiring one inference result
//! - `SearchContext`: sponsor/drug parameters shared by a submission
//! - `BatchOptions`: per-call tuning and progress reporting
//! - `BatchResult`: aggregate outcome of one processing pass

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One literature record requiring one inference result.
///
/// Immutable once created. The PMID is the identity used for deduplication
/// and idempotent result mapping; the payload is carried opaquely and
/// forwarded to callers alongside the inference result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// PubMed identifier of the record.
    pub pmid: String,
    /// Opaque record payload supplied by the caller.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    /// Creates a work item with an empty payload.
    pub fn new(pmid: impl Into<String>) -> Self {
        Self {
            pmid: pmid.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attaches an opaque payload to the item.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Sponsor and drug parameters shared by every item in a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchContext {
    /// Study sponsor name.
    pub sponsor: String,
    /// International nonproprietary name of the drug.
    pub drug_inn: String,
    /// Brand name, when one is known.
    #[serde(default)]
    pub drug_brand: Option<String>,
}

impl SearchContext {
    /// Creates a context without a brand name.
    pub fn new(sponsor: impl Into<String>, drug_inn: impl Into<String>) -> Self {
        Self {
            sponsor: sponsor.into(),
            drug_inn: drug_inn.into(),
            drug_brand: None,
        }
    }

    /// Sets the brand name.
    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.drug_brand = Some(brand.into());
        self
    }

    /// Wire-format drug name: `INN(BrandName)` when a brand is known,
    /// otherwise the INN alone.
    pub fn drug_name(&self) -> String {
        match &self.drug_brand {
            Some(brand) => format!("{}({})", self.drug_inn, brand),
            None => self.drug_inn.clone(),
        }
    }
}

/// Progress snapshot delivered to the batch progress callback after each
/// processed chunk.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    /// Zero-based index of the chunk that just finished.
    pub chunk_index: usize,
    /// Total number of chunks in this pass.
    pub total_chunks: usize,
    /// Items processed so far across the whole call.
    pub processed: usize,
    /// Items resolved successfully so far.
    pub succeeded: usize,
    /// Items terminally failed so far.
    pub failed: usize,
}

/// Callback invoked after each chunk completes.
pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Per-call options for `submit_batch`.
#[derive(Default, Clone)]
pub struct BatchOptions {
    /// Override the configured chunk size (still capped at the configured
    /// maximum).
    pub batch_size: Option<usize>,
    /// Override the configured number of immediate retry passes.
    pub max_immediate_retries: Option<u32>,
    /// Invoked after each chunk with cumulative progress.
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("batch_size", &self.batch_size)
            .field("max_immediate_retries", &self.max_immediate_retries)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl BatchOptions {
    /// Creates options with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the chunk size for this call.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Overrides the immediate retry pass count for this call.
    pub fn with_max_immediate_retries(mut self, retries: u32) -> Self {
        self.max_immediate_retries = Some(retries);
        self
    }

    /// Sets the progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

/// A successfully resolved item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSuccess {
    /// PMID of the resolved item.
    pub pmid: String,
    /// The inference result body, opaque to this layer.
    pub result: serde_json::Value,
    /// Which pass resolved the item (1 = first dispatch).
    pub attempt: u32,
    /// Endpoint that produced the result.
    pub endpoint: String,
    /// Request latency in milliseconds.
    pub latency_ms: u64,
}

/// A terminally failed item (non-retryable classification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    /// PMID of the failed item.
    pub pmid: String,
    /// Human-readable failure description.
    pub error: String,
    /// HTTP status code, when the failure carried one.
    pub status: Option<u16>,
}

/// Items that survived immediate retries and were handed to the durable
/// retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRemainder {
    /// Identifier of the created retry job.
    pub job_id: Uuid,
    /// PMIDs still unresolved when the job was created.
    pub pmids: Vec<String>,
}

/// Aggregate outcome of one batch processing pass.
///
/// Every submitted item appears in exactly one of `successes`, `failures`,
/// `duplicates`, or the queued remainder; nothing is dropped silently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    /// Items resolved with an inference result.
    pub successes: Vec<ItemSuccess>,
    /// Items that failed terminally (4xx classification).
    pub failures: Vec<ItemFailure>,
    /// PMIDs dropped as duplicates of an earlier item in the same call.
    pub duplicates: Vec<String>,
    /// Remainder handed to the durable retry queue, if any.
    pub queued: Option<QueuedRemainder>,
    /// Wall-clock duration of the pass.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl BatchResult {
    /// Total items accounted for by this result.
    pub fn total(&self) -> usize {
        self.successes.len()
            + self.failures.len()
            + self.duplicates.len()
            + self.queued.as_ref().map_or(0, |q| q.pmids.len())
    }

    /// Successful items per second over the pass duration.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.successes.len() as f64 / secs
    }

    /// Whether any items remain unresolved in the retry queue.
    pub fn has_stragglers(&self) -> bool {
        self.queued.as_ref().is_some_and(|q| !q.pmids.is_empty())
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_builder() {
        let item = WorkItem::new("38011234").with_payload(serde_json::json!({"title": "x"}));

        assert_eq!(item.pmid, "38011234");
        assert_eq!(item.payload["title"], "x");
    }

    #[test]
    fn test_search_context_drug_name_with_brand() {
        let ctx = SearchContext::new("Acme Pharma", "adalimumab").with_brand("Humira");
        assert_eq!(ctx.drug_name(), "adalimumab(Humira)");
    }

    #[test]
    fn test_search_context_drug_name_without_brand() {
        let ctx = SearchContext::new("Acme Pharma", "adalimumab");
        assert_eq!(ctx.drug_name(), "adalimumab");
    }

    #[test]
    fn test_batch_options_builder() {
        let opts = BatchOptions::new()
            .with_batch_size(8)
            .with_max_immediate_retries(2);

        assert_eq!(opts.batch_size, Some(8));
        assert_eq!(opts.max_immediate_retries, Some(2));
        assert!(opts.progress.is_none());
    }

    #[test]
    fn test_batch_result_total_accounts_every_item() {
        let result = BatchResult {
            successes: vec![ItemSuccess {
                pmid: "1".into(),
                result: serde_json::Value::Null,
                attempt: 1,
                endpoint: "http://a".into(),
                latency_ms: 50,
            }],
            failures: vec![ItemFailure {
                pmid: "2".into(),
                error: "HTTP 404".into(),
                status: Some(404),
            }],
            duplicates: vec!["1".into()],
            queued: Some(QueuedRemainder {
                job_id: Uuid::new_v4(),
                pmids: vec!["3".into(), "4".into()],
            }),
            duration: Duration::from_secs(2),
        };

        assert_eq!(result.total(), 5);
        assert!(result.has_stragglers());
    }

    #[test]
    fn test_batch_result_throughput() {
        let mut result = BatchResult {
            duration: Duration::from_secs(2),
            ..Default::default()
        };
        for i in 0..4 {
            result.successes.push(ItemSuccess {
                pmid: i.to_string(),
                result: serde_json::Value::Null,
                attempt: 1,
                endpoint: "http://a".into(),
                latency_ms: 10,
            });
        }

        assert!((result.throughput() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_batch_result_throughput_zero_duration() {
        let result = BatchResult::default();
        assert!((result.throughput() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_batch_result_serialization_roundtrip() {
        let result = BatchResult {
            duration: Duration::from_millis(1500),
            ..Default::default()
        };

        let json = serde_json::to_string(&result).expect("serialization should work");
        let parsed: BatchResult = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.duration, Duration::from_millis(1500));
    }
}
