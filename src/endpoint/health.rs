//! Background health monitoring for the endpoint pool.
//!
//! The monitor wakes on a fixed interval and promotes circuits whose open
//! duration has elapsed into the half-open trial state. It also exposes
//! on-demand connection probing used by `test_connection` and the CLI.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::EndpointRegistry;
use crate::backend::InferenceBackend;
use crate::error::FetchError;

/// Probe-time status codes accepted as "endpoint alive" when the
/// validation-error workaround is enabled. Some endpoints reject the
/// probe's empty parameters with 400/422 while serving real traffic fine.
const PROBE_VALIDATION_STATUSES: [u16; 2] = [400, 422];

/// Result of probing one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Endpoint base URL.
    pub url: String,
    /// Whether the endpoint is considered reachable.
    pub alive: bool,
    /// HTTP status returned, when the probe got that far.
    pub status: Option<u16>,
    /// Probe round-trip latency in milliseconds, when measured.
    pub latency_ms: Option<u64>,
    /// Failure description when the endpoint is not alive.
    pub error: Option<String>,
}

/// Periodic monitor driving circuit promotion.
///
/// Owns a background task with a cancellable lifecycle: [`HealthMonitor::
/// start`] spawns it, [`HealthMonitor::stop`] signals shutdown and joins.
pub struct HealthMonitor {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthMonitor {
    /// Starts the monitor loop.
    pub fn start(registry: Arc<EndpointRegistry>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a freshly
            // started service doesn't log a pointless sweep
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::sweep(&registry);
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Health monitor received shutdown signal");
                        break;
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
            shutdown_tx,
        }
    }

    /// One monitor pass: promote circuits whose open duration elapsed and
    /// log the pool's health at debug level.
    fn sweep(registry: &EndpointRegistry) {
        let mut promoted = 0;
        for endpoint in registry.endpoints() {
            if endpoint.try_promote() {
                promoted += 1;
            }
        }

        debug!(
            available = registry.available_count(),
            total = registry.total_count(),
            promoted = promoted,
            "Health monitor sweep complete"
        );
    }

    /// Signals the monitor to stop and waits for the task to finish.
    pub async fn stop(mut self) {
        // Ignore send error - the task may have already stopped
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task panicked");
            }
        }
    }
}

/// Probes every endpoint concurrently and reports reachability.
///
/// Does not mutate circuit state: a probe is a reachability report, not
/// traffic. Validation-style 4xx responses count as alive when
/// `accept_validation_errors` is set.
pub async fn probe_all(
    registry: &EndpointRegistry,
    backend: &dyn InferenceBackend,
    accept_validation_errors: bool,
) -> Vec<ProbeOutcome> {
    let probes = registry.endpoints().iter().map(|endpoint| {
        let url = endpoint.url().to_string();
        async move {
            match backend.probe(&url).await {
                Ok(report) => ProbeOutcome {
                    url,
                    alive: true,
                    status: Some(report.status),
                    latency_ms: Some(report.latency.as_millis() as u64),
                    error: None,
                },
                Err(e) => probe_failure(url, e, accept_validation_errors),
            }
        }
    });

    join_all(probes).await
}

fn probe_failure(url: String, error: FetchError, accept_validation_errors: bool) -> ProbeOutcome {
    let status = error.status();
    let alive = accept_validation_errors
        && status.is_some_and(|s| PROBE_VALIDATION_STATUSES.contains(&s));

    if !alive {
        warn!(endpoint = %url, error = %error, "Endpoint probe failed");
    }

    ProbeOutcome {
        url,
        alive,
        status,
        latency_ms: None,
        error: (!alive).then(|| error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProbeReport;
    use crate::config::DispatchConfig;
    use crate::work::{SearchContext, WorkItem};
    use async_trait::async_trait;

    /// Backend whose probes answer from a fixed script.
    struct ScriptedProbeBackend {
        /// Status per endpoint URL; absent entries fail with a
        /// connection error.
        statuses: std::collections::HashMap<String, u16>,
    }

    #[async_trait]
    impl InferenceBackend for ScriptedProbeBackend {
        async fn fetch(
            &self,
            _base_url: &str,
            _item: &WorkItem,
            _context: &SearchContext,
        ) -> Result<serde_json::Value, FetchError> {
            unreachable!("probe tests never fetch")
        }

        async fn probe(&self, base_url: &str) -> Result<ProbeReport, FetchError> {
            match self.statuses.get(base_url) {
                Some(status) if *status < 400 => Ok(ProbeReport {
                    latency: Duration::from_millis(12),
                    status: *status,
                }),
                Some(status) if *status < 500 => Err(FetchError::Client {
                    status: *status,
                    message: "validation failed".into(),
                }),
                Some(status) => Err(FetchError::Server { status: *status }),
                None => Err(FetchError::Connection("refused".into())),
            }
        }
    }

    fn registry(urls: &[&str]) -> EndpointRegistry {
        EndpointRegistry::new(&DispatchConfig::new(
            urls.iter().map(|s| s.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn test_probe_all_reports_alive_and_dead() {
        let registry = registry(&["http://ok", "http://down"]);
        let backend = ScriptedProbeBackend {
            statuses: [("http://ok".to_string(), 200)].into_iter().collect(),
        };

        let outcomes = probe_all(&registry, &backend, true).await;

        assert_eq!(outcomes.len(), 2);
        let ok = outcomes.iter().find(|o| o.url == "http://ok").unwrap();
        assert!(ok.alive);
        assert_eq!(ok.status, Some(200));
        assert!(ok.latency_ms.is_some());

        let down = outcomes.iter().find(|o| o.url == "http://down").unwrap();
        assert!(!down.alive);
        assert!(down.error.is_some());
    }

    #[tokio::test]
    async fn test_probe_validation_status_counts_as_alive_when_enabled() {
        let registry = registry(&["http://picky"]);
        let backend = ScriptedProbeBackend {
            statuses: [("http://picky".to_string(), 422)].into_iter().collect(),
        };

        let outcomes = probe_all(&registry, &backend, true).await;
        assert!(outcomes[0].alive);
        assert_eq!(outcomes[0].status, Some(422));

        let outcomes = probe_all(&registry, &backend, false).await;
        assert!(!outcomes[0].alive);
    }

    #[tokio::test]
    async fn test_probe_server_error_is_dead_regardless_of_toggle() {
        let registry = registry(&["http://broken"]);
        let backend = ScriptedProbeBackend {
            statuses: [("http://broken".to_string(), 503)].into_iter().collect(),
        };

        let outcomes = probe_all(&registry, &backend, true).await;
        assert!(!outcomes[0].alive);
        assert_eq!(outcomes[0].status, Some(503));
    }

    #[tokio::test]
    async fn test_monitor_promotes_open_circuits() {
        let mut config = DispatchConfig::new(vec!["http://a".to_string()]);
        config.circuit_open_duration = Duration::from_millis(10);
        let registry = Arc::new(EndpointRegistry::new(&config));
        let ep = Arc::clone(&registry.endpoints()[0]);

        for _ in 0..3 {
            ep.record_failure("HTTP 500");
        }
        assert_eq!(
            ep.circuit_state(),
            crate::endpoint::circuit::CircuitState::Open
        );

        let monitor = HealthMonitor::start(Arc::clone(&registry), Duration::from_millis(20));

        // Wait for the open duration and at least one sweep
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            ep.circuit_state(),
            crate::endpoint::circuit::CircuitState::HalfOpen
        );

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_stop_joins_cleanly() {
        let registry = Arc::new(registry(&["http://a"]));
        let monitor = HealthMonitor::start(registry, Duration::from_secs(3600));
        monitor.stop().await;
    }
}
