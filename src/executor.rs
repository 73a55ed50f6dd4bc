//! Single-attempt request execution.
//!
//! The executor performs exactly one call to one endpoint for one work
//! item, applies the hard deadline, classifies the outcome, reports it to
//! the endpoint's health state, and emits one structured log and metric
//! record per attempt. The in-flight slot is released on every path by
//! the permit guard, including timeout and panic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::InferenceBackend;
use crate::endpoint::EndpointPermit;
use crate::error::FetchError;
use crate::work::{SearchContext, WorkItem};

/// Outcome of a single dispatch attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The endpoint returned a decodable result.
    Success {
        result: serde_json::Value,
        endpoint: String,
        latency: Duration,
    },
    /// The attempt failed; `error.is_retryable()` governs what happens
    /// next.
    Failure(FetchError),
}

/// Executes single attempts against reserved endpoints.
pub struct RequestExecutor {
    backend: Arc<dyn InferenceBackend>,
    /// Hard deadline applied around the backend call. The HTTP backend
    /// carries its own client timeout; this outer deadline also bounds
    /// alternative backend implementations.
    request_timeout: Duration,
}

impl RequestExecutor {
    /// Creates an executor over the given backend.
    pub fn new(backend: Arc<dyn InferenceBackend>, request_timeout: Duration) -> Self {
        Self {
            backend,
            request_timeout,
        }
    }

    /// Performs one call for one item against the endpoint reserved by
    /// `permit`.
    ///
    /// Consumes the permit; its guard decrements the endpoint's in-flight
    /// count when this function returns, whatever the outcome.
    pub async fn execute(
        &self,
        permit: EndpointPermit,
        item: &WorkItem,
        context: &SearchContext,
    ) -> AttemptOutcome {
        let endpoint = Arc::clone(permit.endpoint());
        let url = endpoint.url().to_string();
        let start = Instant::now();

        let result = tokio::time::timeout(
            self.request_timeout,
            self.backend.fetch(&url, item, context),
        )
        .await;

        let latency = start.elapsed();

        // Flatten the deadline wrapper into the fetch taxonomy
        let outcome = match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FetchError::Timeout {
                seconds: self.request_timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(body) => {
                endpoint.record_success(latency);
                crate::metrics::record_attempt(&url, "success", latency);
                info!(
                    endpoint = %url,
                    pmid = %item.pmid,
                    latency_ms = latency.as_millis() as u64,
                    outcome = "success",
                    "Inference attempt complete"
                );
                drop(permit);
                AttemptOutcome::Success {
                    result: body,
                    endpoint: url,
                    latency,
                }
            }
            Err(error) => {
                let label = error.outcome_label();
                endpoint.record_failure(label);
                crate::metrics::record_attempt(&url, label, latency);
                warn!(
                    endpoint = %url,
                    pmid = %item.pmid,
                    latency_ms = latency.as_millis() as u64,
                    outcome = label,
                    error = %error,
                    "Inference attempt failed"
                );
                drop(permit);
                AttemptOutcome::Failure(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::endpoint::EndpointRegistry;
    use async_trait::async_trait;

    /// Backend returning a canned response or failure.
    struct FixedBackend {
        response: Result<serde_json::Value, u16>,
        delay: Duration,
    }

    #[async_trait]
    impl InferenceBackend for FixedBackend {
        async fn fetch(
            &self,
            _base_url: &str,
            _item: &WorkItem,
            _context: &SearchContext,
        ) -> Result<serde_json::Value, FetchError> {
            tokio::time::sleep(self.delay).await;
            match &self.response {
                Ok(v) => Ok(v.clone()),
                Err(status) if *status >= 500 => Err(FetchError::Server { status: *status }),
                Err(status) => Err(FetchError::Client {
                    status: *status,
                    message: "rejected".into(),
                }),
            }
        }

        async fn probe(&self, _base_url: &str) -> Result<crate::backend::ProbeReport, FetchError> {
            unreachable!("executor tests never probe")
        }
    }

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(&DispatchConfig::new(vec!["http://a".to_string()]))
    }

    #[tokio::test]
    async fn test_execute_success_records_and_releases_slot() {
        let registry = registry();
        let ep = Arc::clone(&registry.endpoints()[0]);
        let executor = RequestExecutor::new(
            Arc::new(FixedBackend {
                response: Ok(serde_json::json!({"relevant": true})),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );

        let permit = ep.try_reserve().expect("slot");
        let outcome = executor
            .execute(permit, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        assert!(matches!(outcome, AttemptOutcome::Success { .. }));
        assert_eq!(ep.current_in_flight(), 0);

        let snap = ep.snapshot();
        assert_eq!(snap.total_successes, 1);
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_execute_server_error_records_failure() {
        let registry = registry();
        let ep = Arc::clone(&registry.endpoints()[0]);
        let executor = RequestExecutor::new(
            Arc::new(FixedBackend {
                response: Err(502),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );

        let permit = ep.try_reserve().expect("slot");
        let outcome = executor
            .execute(permit, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        match outcome {
            AttemptOutcome::Failure(e) => {
                assert!(e.is_retryable());
                assert_eq!(e.status(), Some(502));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(ep.current_in_flight(), 0);
        assert_eq!(ep.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_timeout_classified_retryable_and_slot_released() {
        let registry = registry();
        let ep = Arc::clone(&registry.endpoints()[0]);
        let executor = RequestExecutor::new(
            Arc::new(FixedBackend {
                response: Ok(serde_json::Value::Null),
                delay: Duration::from_secs(30),
            }),
            Duration::from_millis(20),
        );

        let permit = ep.try_reserve().expect("slot");
        let outcome = executor
            .execute(permit, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        match outcome {
            AttemptOutcome::Failure(FetchError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }

        // The deadline path must still release the slot and record the
        // failure
        assert_eq!(ep.current_in_flight(), 0);
        assert_eq!(ep.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_client_error_not_retryable() {
        let registry = registry();
        let ep = Arc::clone(&registry.endpoints()[0]);
        let executor = RequestExecutor::new(
            Arc::new(FixedBackend {
                response: Err(404),
                delay: Duration::ZERO,
            }),
            Duration::from_secs(5),
        );

        let permit = ep.try_reserve().expect("slot");
        let outcome = executor
            .execute(permit, &WorkItem::new("1"), &SearchContext::new("s", "d"))
            .await;

        match outcome {
            AttemptOutcome::Failure(e) => assert!(!e.is_retryable()),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
