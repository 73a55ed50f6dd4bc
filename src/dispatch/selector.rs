//! Endpoint selection and per-item dispatch.
//!
//! Given one work item, the selector builds an ordered candidate list:
//! open circuits and endpoints at their concurrency cap are excluded,
//! closed circuits are preferred over half-open ones, then endpoints with
//! fewer in-flight requests, higher historical success rate, and lower
//! average latency. Candidates are tried in order until one produces a
//! terminal outcome for the attempt.
//!
//! Two global limits apply before any request is issued: a semaphore
//! bounding total in-flight requests across all endpoints, and a pacer
//! enforcing a minimum interval between consecutive outbound requests.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::config::DispatchConfig;
use crate::endpoint::{CircuitState, Endpoint, EndpointRegistry};
use crate::error::FetchError;
use crate::executor::{AttemptOutcome, RequestExecutor};
use crate::work::{SearchContext, WorkItem};

/// Outcome of dispatching one item once through the candidate list.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Some endpoint produced a result.
    Success {
        result: serde_json::Value,
        endpoint: String,
        latency_ms: u64,
    },
    /// A 4xx classification; the item must not be retried anywhere.
    Fatal(FetchError),
    /// Every tried endpoint failed retryably.
    Retryable(FetchError),
    /// No endpoint could even be tried: all circuits open, at capacity,
    /// or mid-trial.
    Unavailable,
}

/// Selects endpoints and drives per-item dispatch.
pub struct EndpointSelector {
    registry: Arc<EndpointRegistry>,
    /// Global in-flight cap across all endpoints.
    global_limit: Arc<Semaphore>,
    /// Earliest instant the next request may be issued.
    next_send: Mutex<tokio::time::Instant>,
    min_interval: Duration,
}

impl EndpointSelector {
    /// Creates a selector over the registry with the configured limits.
    pub fn new(registry: Arc<EndpointRegistry>, config: &DispatchConfig) -> Self {
        Self {
            registry,
            global_limit: Arc::new(Semaphore::new(config.max_concurrency)),
            next_send: Mutex::new(tokio::time::Instant::now()),
            min_interval: config.min_request_interval,
        }
    }

    /// Ordered candidate list for one dispatch attempt.
    ///
    /// Excludes open circuits and endpoints already at their cap; sorts
    /// closed before half-open, then fewer in-flight, higher success
    /// rate, lower average latency.
    pub fn candidates(&self) -> Vec<Arc<Endpoint>> {
        let mut eligible: Vec<(Arc<Endpoint>, CandidateKey)> = self
            .registry
            .endpoints()
            .iter()
            .filter_map(|endpoint| {
                let snap = endpoint.snapshot();
                if snap.circuit_state == CircuitState::Open {
                    return None;
                }
                if snap.current_in_flight >= snap.capacity {
                    return None;
                }
                let key = CandidateKey {
                    half_open: snap.circuit_state == CircuitState::HalfOpen,
                    in_flight: snap.current_in_flight,
                    success_rate: snap.success_rate,
                    average_latency_ms: snap.average_latency_ms,
                };
                Some((Arc::clone(endpoint), key))
            })
            .collect();

        eligible.sort_by(|(_, a), (_, b)| a.cmp(b));
        eligible.into_iter().map(|(endpoint, _)| endpoint).collect()
    }

    /// Waits until the minimum inter-request interval allows another
    /// outbound request.
    async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let mut next_send = self.next_send.lock().await;
        let now = tokio::time::Instant::now();
        let scheduled = *next_send;
        *next_send = scheduled.max(now) + self.min_interval;
        drop(next_send);

        if scheduled > now {
            tokio::time::sleep_until(scheduled).await;
        }
    }

    /// Dispatches one item through the candidate list.
    ///
    /// The item occupies at most one endpoint slot at a time: candidates
    /// are tried strictly in sequence. A non-retryable failure stops the
    /// walk immediately.
    pub async fn dispatch(
        &self,
        executor: &RequestExecutor,
        item: &WorkItem,
        context: &SearchContext,
    ) -> DispatchOutcome {
        // Hold a global slot for the whole walk so total in-flight work
        // stays bounded even while failing over between endpoints.
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("global semaphore never closed");

        let candidates = self.candidates();
        if candidates.is_empty() {
            debug!(pmid = %item.pmid, "No endpoints available for dispatch");
            return DispatchOutcome::Unavailable;
        }

        let mut last_error: Option<FetchError> = None;
        let mut attempted = false;

        for endpoint in candidates {
            // Reservation can fail even for a sorted candidate: another
            // task may have taken the last slot or the trial permit since
            // the snapshot
            let Some(permit) = endpoint.try_reserve() else {
                continue;
            };
            attempted = true;

            self.pace().await;

            match executor.execute(permit, item, context).await {
                AttemptOutcome::Success {
                    result,
                    endpoint,
                    latency,
                } => {
                    return DispatchOutcome::Success {
                        result,
                        endpoint,
                        latency_ms: latency.as_millis() as u64,
                    };
                }
                AttemptOutcome::Failure(error) if !error.is_retryable() => {
                    return DispatchOutcome::Fatal(error);
                }
                AttemptOutcome::Failure(error) => {
                    last_error = Some(error);
                }
            }
        }

        match (attempted, last_error) {
            (true, Some(error)) => DispatchOutcome::Retryable(error),
            _ => DispatchOutcome::Unavailable,
        }
    }
}

/// Sort key implementing the candidate ordering.
#[derive(Debug)]
struct CandidateKey {
    half_open: bool,
    in_flight: usize,
    success_rate: f64,
    average_latency_ms: f64,
}

impl CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.half_open
            .cmp(&other.half_open)
            .then(self.in_flight.cmp(&other.in_flight))
            .then(
                other
                    .success_rate
                    .partial_cmp(&self.success_rate)
                    .unwrap_or(Ordering::Equal),
            )
            .then(
                self.average_latency_ms
                    .partial_cmp(&other.average_latency_ms)
                    .unwrap_or(Ordering::Equal),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InferenceBackend, ProbeReport};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Backend answering per-endpoint from a script, counting calls.
    struct ScriptedBackend {
        /// Status per endpoint URL; 200 returns a JSON body.
        statuses: HashMap<String, u16>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(statuses: &[(&str, u16)]) -> Self {
            Self {
                statuses: statuses
                    .iter()
                    .map(|(url, s)| (url.to_string(), *s))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn fetch(
            &self,
            base_url: &str,
            item: &WorkItem,
            _context: &SearchContext,
        ) -> Result<serde_json::Value, FetchError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            match self.statuses.get(base_url).copied().unwrap_or(200) {
                s if s < 300 => Ok(serde_json::json!({"pmid": item.pmid})),
                s if s < 500 => Err(FetchError::Client {
                    status: s,
                    message: "rejected".into(),
                }),
                s => Err(FetchError::Server { status: s }),
            }
        }

        async fn probe(&self, _base_url: &str) -> Result<ProbeReport, FetchError> {
            unreachable!("selector tests never probe")
        }
    }

    fn setup(
        urls: &[&str],
        statuses: &[(&str, u16)],
    ) -> (Arc<EndpointRegistry>, EndpointSelector, RequestExecutor) {
        let mut config = DispatchConfig::new(urls.iter().map(|s| s.to_string()).collect());
        config.min_request_interval = Duration::ZERO;
        let registry = Arc::new(EndpointRegistry::new(&config));
        let selector = EndpointSelector::new(Arc::clone(&registry), &config);
        let executor = RequestExecutor::new(
            Arc::new(ScriptedBackend::new(statuses)),
            Duration::from_secs(5),
        );
        (registry, selector, executor)
    }

    #[tokio::test]
    async fn test_dispatch_succeeds_on_first_candidate() {
        let (_registry, selector, executor) = setup(&["http://a"], &[("http://a", 200)]);

        let outcome = selector
            .dispatch(&executor, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        assert!(matches!(outcome, DispatchOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_fails_over_to_healthy_endpoint() {
        let (_registry, selector, executor) = setup(
            &["http://bad", "http://good"],
            &[("http://bad", 500), ("http://good", 200)],
        );

        let outcome = selector
            .dispatch(&executor, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        match outcome {
            DispatchOutcome::Success { endpoint, .. } => assert_eq!(endpoint, "http://good"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_stops_on_client_error() {
        let (_registry, selector, executor) = setup(
            &["http://a", "http://b"],
            &[("http://a", 404), ("http://b", 200)],
        );

        let outcome = selector
            .dispatch(&executor, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        // 4xx is terminal: no failover to the second endpoint
        assert!(matches!(outcome, DispatchOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_dispatch_unavailable_when_all_circuits_open() {
        let (registry, selector, executor) = setup(&["http://a"], &[("http://a", 500)]);

        for _ in 0..3 {
            registry.endpoints()[0].record_failure("HTTP 500");
        }

        let outcome = selector
            .dispatch(&executor, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        assert!(matches!(outcome, DispatchOutcome::Unavailable));
    }

    #[tokio::test]
    async fn test_dispatch_retryable_when_all_endpoints_fail() {
        let (_registry, selector, executor) = setup(
            &["http://a", "http://b"],
            &[("http://a", 503), ("http://b", 502)],
        );

        let outcome = selector
            .dispatch(&executor, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        match outcome {
            DispatchOutcome::Retryable(e) => assert!(e.is_retryable()),
            other => panic!("expected retryable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_candidates_exclude_open_and_order_by_load() {
        let (registry, selector, _executor) =
            setup(&["http://a", "http://b", "http://c"], &[]);

        // Open http://a's circuit
        for _ in 0..3 {
            registry.endpoints()[0].record_failure("HTTP 500");
        }
        // Load http://b with one in-flight request
        let _permit = registry.endpoints()[1].try_reserve().expect("slot");

        let candidates = selector.candidates();
        let urls: Vec<&str> = candidates.iter().map(|e| e.url()).collect();

        assert_eq!(urls, vec!["http://c", "http://b"]);
    }

    #[tokio::test]
    async fn test_candidates_prefer_higher_success_rate() {
        let (registry, selector, _executor) = setup(&["http://a", "http://b"], &[]);

        // Same in-flight; http://b has a better record
        registry.endpoints()[0].record_failure("timeout");
        registry.endpoints()[0].record_success(Duration::from_millis(10));
        registry.endpoints()[1].record_success(Duration::from_millis(10));

        let candidates = selector.candidates();
        assert_eq!(candidates[0].url(), "http://b");
    }

    #[tokio::test]
    async fn test_pace_spaces_requests() {
        let mut config = DispatchConfig::new(vec!["http://a".to_string()]);
        config.min_request_interval = Duration::from_millis(30);
        let registry = Arc::new(EndpointRegistry::new(&config));
        let selector = EndpointSelector::new(registry, &config);

        let start = tokio::time::Instant::now();
        selector.pace().await;
        selector.pace().await;
        selector.pace().await;

        // Three paced sends need roughly two full intervals; allow a
        // small margin for the gap between selector creation and `start`
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
