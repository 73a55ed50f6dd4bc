//! Endpoint registry and per-endpoint health accounting.
//!
//! One [`Endpoint`] exists per configured URL for the process lifetime.
//! All counter and circuit mutation goes through the endpoint's health
//! mutex so concurrent success/failure reporting never loses updates.
//! In-flight bounding is enforced with a semaphore whose permits travel
//! inside [`EndpointPermit`] guards, so a slot can never leak and the
//! in-flight count can never go negative or exceed the cap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use super::circuit::{CircuitBreaker, CircuitState, CircuitTransition};
use crate::config::DispatchConfig;

/// Mutable health state of one endpoint, guarded by the endpoint mutex.
#[derive(Debug)]
struct EndpointHealth {
    breaker: CircuitBreaker,
    total_requests: u64,
    total_successes: u64,
    /// Cumulative mean latency over successful requests, in milliseconds.
    average_latency_ms: f64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    circuit_opened_at: Option<DateTime<Utc>>,
}

/// One configured inference endpoint and its health state.
pub struct Endpoint {
    url: String,
    capacity: usize,
    /// Per-endpoint concurrency cap.
    limiter: Arc<Semaphore>,
    /// Single-permit gate for the half-open trial call.
    trial: Arc<Semaphore>,
    /// In-flight counter mirroring held permits, for reporting and sorting.
    in_flight: AtomicUsize,
    health: Mutex<EndpointHealth>,
}

impl Endpoint {
    fn new(url: String, config: &DispatchConfig) -> Self {
        Self {
            url,
            capacity: config.per_endpoint_concurrency,
            limiter: Arc::new(Semaphore::new(config.per_endpoint_concurrency)),
            trial: Arc::new(Semaphore::new(1)),
            in_flight: AtomicUsize::new(0),
            health: Mutex::new(EndpointHealth {
                breaker: CircuitBreaker::new(
                    config.circuit_failure_threshold,
                    config.circuit_open_duration,
                ),
                total_requests: 0,
                total_successes: 0,
                average_latency_ms: 0.0,
                last_success_at: None,
                last_failure_at: None,
                circuit_opened_at: None,
            }),
        }
    }

    /// Base URL of this endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of requests currently in flight.
    pub fn current_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Current circuit state.
    pub fn circuit_state(&self) -> CircuitState {
        self.lock_health().breaker.state()
    }

    /// Attempts to reserve a request slot against this endpoint.
    ///
    /// Returns `None` when the circuit is open, the endpoint is at its
    /// concurrency cap, or a half-open trial is already in flight. The
    /// health mutex is held across the checks so reservation is atomic
    /// with respect to outcome recording.
    pub fn try_reserve(self: &Arc<Self>) -> Option<EndpointPermit> {
        let health = self.lock_health();

        let trial_permit = match health.breaker.state() {
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                // Exactly one trial call while half-open
                Some(Arc::clone(&self.trial).try_acquire_owned().ok()?)
            }
            CircuitState::Closed => None,
        };

        let limit_permit = Arc::clone(&self.limiter).try_acquire_owned().ok()?;
        drop(health);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        crate::metrics::in_flight_delta(&self.url, 1);

        Some(EndpointPermit {
            endpoint: Arc::clone(self),
            _limit: limit_permit,
            _trial: trial_permit,
        })
    }

    /// Records a successful call and its latency.
    pub fn record_success(&self, latency: Duration) {
        let mut health = self.lock_health();

        health.total_requests += 1;
        health.total_successes += 1;
        health.last_success_at = Some(Utc::now());

        // Cumulative mean over successes
        let n = health.total_successes as f64;
        let latency_ms = latency.as_millis() as f64;
        health.average_latency_ms += (latency_ms - health.average_latency_ms) / n;

        if let Some(CircuitTransition::Closed) = health.breaker.record_success() {
            health.circuit_opened_at = None;
            info!(endpoint = %self.url, "Circuit closed after successful trial");
        }
        crate::metrics::set_circuit_state(&self.url, health.breaker.state());
    }

    /// Records a failed call.
    pub fn record_failure(&self, reason: &str) {
        let mut health = self.lock_health();

        health.total_requests += 1;
        health.last_failure_at = Some(Utc::now());

        if let Some(CircuitTransition::Opened) = health.breaker.record_failure() {
            health.circuit_opened_at = Some(Utc::now());
            warn!(
                endpoint = %self.url,
                consecutive_failures = health.breaker.consecutive_failures(),
                reason = reason,
                "Circuit opened"
            );
        }
        crate::metrics::set_circuit_state(&self.url, health.breaker.state());
    }

    /// Promotes an open circuit to half-open once its open duration has
    /// elapsed. Returns true when a promotion happened.
    pub fn try_promote(&self) -> bool {
        let mut health = self.lock_health();
        let promoted = health.breaker.try_promote().is_some();
        if promoted {
            info!(endpoint = %self.url, "Circuit half-open, trial window available");
            crate::metrics::set_circuit_state(&self.url, health.breaker.state());
        }
        promoted
    }

    /// Read-only copy of this endpoint's state for reporting.
    pub fn snapshot(&self) -> EndpointSnapshot {
        let health = self.lock_health();
        EndpointSnapshot {
            url: self.url.clone(),
            circuit_state: health.breaker.state(),
            consecutive_failures: health.breaker.consecutive_failures(),
            total_requests: health.total_requests,
            total_successes: health.total_successes,
            success_rate: success_rate(health.total_successes, health.total_requests),
            average_latency_ms: health.average_latency_ms,
            current_in_flight: self.in_flight.load(Ordering::SeqCst),
            capacity: self.capacity,
            last_success_at: health.last_success_at,
            last_failure_at: health.last_failure_at,
            circuit_opened_at: health.circuit_opened_at,
        }
    }

    /// Historical success rate; endpoints with no history rank as healthy.
    pub fn success_rate(&self) -> f64 {
        let health = self.lock_health();
        success_rate(health.total_successes, health.total_requests)
    }

    /// Cumulative mean latency of successful requests.
    pub fn average_latency_ms(&self) -> f64 {
        self.lock_health().average_latency_ms
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, EndpointHealth> {
        // Poisoning only happens if a panic occurred mid-update; the
        // counters are simple enough that continuing is safe.
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

fn success_rate(successes: u64, requests: u64) -> f64 {
    if requests == 0 {
        return 1.0;
    }
    successes as f64 / requests as f64
}

/// RAII guard for one reserved request slot.
///
/// Holds the per-endpoint semaphore permit (and the trial permit while
/// half-open). Dropping the guard releases the slot and decrements the
/// in-flight counter exactly once, on every completion path including
/// timeouts and cancellation.
pub struct EndpointPermit {
    endpoint: Arc<Endpoint>,
    _limit: OwnedSemaphorePermit,
    _trial: Option<OwnedSemaphorePermit>,
}

impl EndpointPermit {
    /// The endpoint this permit reserves a slot on.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

impl Drop for EndpointPermit {
    fn drop(&mut self) {
        self.endpoint.in_flight.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::in_flight_delta(&self.endpoint.url, -1);
    }
}

/// Read-only view of one endpoint's health for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub current_in_flight: usize,
    pub capacity: usize,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_opened_at: Option<DateTime<Utc>>,
}

/// The pool of configured endpoints.
///
/// Constructed once at service start; endpoints live for the process
/// lifetime and are shared by reference with the dispatcher, executor,
/// and health monitor.
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointRegistry {
    /// Builds the registry from the configured endpoint URLs.
    pub fn new(config: &DispatchConfig) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .map(|url| Arc::new(Endpoint::new(url.clone(), config)))
            .collect();

        Self { endpoints }
    }

    /// All endpoints in configuration order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Looks up an endpoint by URL.
    pub fn get(&self, url: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.url() == url)
    }

    /// Number of endpoints whose circuit is not open.
    pub fn available_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.circuit_state() != CircuitState::Open)
            .count()
    }

    /// Total configured endpoints.
    pub fn total_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Snapshots of every endpoint for status reporting.
    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(urls: &[&str]) -> DispatchConfig {
        let mut config = DispatchConfig::new(urls.iter().map(|s| s.to_string()).collect());
        config.per_endpoint_concurrency = 2;
        config
    }

    fn single_endpoint() -> Arc<Endpoint> {
        let registry = EndpointRegistry::new(&test_config(&["http://a"]));
        Arc::clone(&registry.endpoints()[0])
    }

    #[test]
    fn test_registry_builds_one_endpoint_per_url() {
        let registry = EndpointRegistry::new(&test_config(&["http://a", "http://b"]));

        assert_eq!(registry.total_count(), 2);
        assert_eq!(registry.available_count(), 2);
        assert!(registry.get("http://a").is_some());
        assert!(registry.get("http://c").is_none());
    }

    #[test]
    fn test_reserve_respects_capacity() {
        let ep = single_endpoint();

        let p1 = ep.try_reserve().expect("first slot");
        let p2 = ep.try_reserve().expect("second slot");
        assert_eq!(ep.current_in_flight(), 2);

        // Cap is 2: third reservation must fail
        assert!(ep.try_reserve().is_none());

        drop(p1);
        assert_eq!(ep.current_in_flight(), 1);
        let _p3 = ep.try_reserve().expect("slot freed by drop");
        drop(p2);
    }

    #[test]
    fn test_in_flight_never_negative_after_drops() {
        let ep = single_endpoint();
        let permit = ep.try_reserve().expect("slot");
        drop(permit);
        assert_eq!(ep.current_in_flight(), 0);
    }

    #[test]
    fn test_open_circuit_blocks_reservation() {
        let ep = single_endpoint();
        for _ in 0..3 {
            ep.record_failure("HTTP 500");
        }

        assert_eq!(ep.circuit_state(), CircuitState::Open);
        assert!(ep.try_reserve().is_none());
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let ep = single_endpoint();
        for _ in 0..3 {
            ep.record_failure("HTTP 500");
        }

        // Promote by hand (the monitor normally does this after the
        // open duration)
        {
            let mut health = ep.health.lock().unwrap();
            health
                .breaker
                .force_opened_at(std::time::Instant::now() - Duration::from_secs(120));
        }
        assert!(ep.try_promote());
        assert_eq!(ep.circuit_state(), CircuitState::HalfOpen);

        let trial = ep.try_reserve().expect("one trial slot");
        // Second concurrent trial must be refused even though capacity
        // remains
        assert!(ep.try_reserve().is_none());

        drop(trial);
        assert!(ep.try_reserve().is_some());
    }

    #[test]
    fn test_success_resets_failures_and_updates_average() {
        let ep = single_endpoint();
        ep.record_failure("timeout");
        ep.record_success(Duration::from_millis(100));
        ep.record_success(Duration::from_millis(300));

        let snap = ep.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.total_successes, 2);
        assert!((snap.average_latency_ms - 200.0).abs() < 0.001);
        assert!(snap.last_success_at.is_some());
        assert!(snap.last_failure_at.is_some());
    }

    #[test]
    fn test_trial_success_closes_circuit() {
        let ep = single_endpoint();
        for _ in 0..3 {
            ep.record_failure("HTTP 500");
        }
        {
            let mut health = ep.health.lock().unwrap();
            health
                .breaker
                .force_opened_at(std::time::Instant::now() - Duration::from_secs(120));
        }
        ep.try_promote();

        ep.record_success(Duration::from_millis(50));
        assert_eq!(ep.circuit_state(), CircuitState::Closed);

        let snap = ep.snapshot();
        assert!(snap.circuit_opened_at.is_none());
    }

    #[test]
    fn test_success_rate_defaults_to_healthy() {
        let ep = single_endpoint();
        assert!((ep.success_rate() - 1.0).abs() < f64::EPSILON);

        ep.record_failure("timeout");
        assert!((ep.success_rate() - 0.0).abs() < f64::EPSILON);

        ep.record_success(Duration::from_millis(10));
        assert!((ep.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_in_flight_invariant_under_concurrent_interleavings() {
        let mut config = test_config(&["http://a"]);
        config.per_endpoint_concurrency = 3;
        let registry = Arc::new(EndpointRegistry::new(&config));
        let ep = Arc::clone(&registry.endpoints()[0]);

        let mut handles = Vec::new();
        for i in 0..32 {
            let ep = Arc::clone(&ep);
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    if let Some(permit) = ep.try_reserve() {
                        // In-flight must stay within [1, cap] while held
                        let in_flight = ep.current_in_flight();
                        assert!(in_flight >= 1 && in_flight <= 3);

                        tokio::task::yield_now().await;
                        if (i + j) % 3 == 0 {
                            ep.record_failure("HTTP 503");
                        } else {
                            ep.record_success(Duration::from_millis(5));
                        }
                        drop(permit);
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.expect("task should not panic");
        }

        assert_eq!(ep.current_in_flight(), 0);
    }
}
