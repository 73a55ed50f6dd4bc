//! Prometheus metrics for dispatch observability.
//!
//! Metrics are registered once at startup via [`init_metrics`] and
//! exported as Prometheus text via [`export_metrics`]. The recording
//! helpers are no-ops until initialization so library consumers that do
//! not scrape metrics pay nothing.
//!
//! # Example
//!
//! ```ignore
//! use inferelay::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run the service ...
//! let text = export_metrics();
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};

use crate::endpoint::CircuitState;

/// Global Prometheus registry for all inferelay metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total inference attempts, labeled by endpoint and outcome.
pub static ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Attempt latency in seconds, labeled by endpoint.
pub static ATTEMPT_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Requests currently in flight, labeled by endpoint.
pub static IN_FLIGHT: OnceLock<GaugeVec> = OnceLock::new();

/// Circuit state per endpoint (0 = closed, 1 = half-open, 2 = open).
pub static CIRCUIT_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs held by the durable retry queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Terminal item outcomes, labeled by outcome.
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Idempotent: calling it twice leaves the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let attempts_total = CounterVec::new(
        Opts::new("inferelay_attempts_total", "Total inference attempts"),
        &["endpoint", "outcome"],
    )?;

    // Buckets sized for slow endpoints with 45-60s typical latency
    let attempt_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "inferelay_attempt_latency_seconds",
            "Inference attempt latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 45.0, 60.0, 90.0, 120.0]),
        &["endpoint"],
    )?;

    let in_flight = GaugeVec::new(
        Opts::new("inferelay_in_flight", "Requests currently in flight"),
        &["endpoint"],
    )?;

    let circuit_state = GaugeVec::new(
        Opts::new(
            "inferelay_circuit_state",
            "Circuit state per endpoint (0=closed, 1=half-open, 2=open)",
        ),
        &["endpoint"],
    )?;

    let queue_depth = Gauge::new(
        "inferelay_retry_queue_depth",
        "Jobs held by the durable retry queue",
    )?;

    let items_total = CounterVec::new(
        Opts::new("inferelay_items_total", "Terminal item outcomes"),
        &["outcome"],
    )?;

    registry.register(Box::new(attempts_total.clone()))?;
    registry.register(Box::new(attempt_latency.clone()))?;
    registry.register(Box::new(in_flight.clone()))?;
    registry.register(Box::new(circuit_state.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(items_total.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ATTEMPTS_TOTAL.set(attempts_total);
    let _ = ATTEMPT_LATENCY.set(attempt_latency);
    let _ = IN_FLIGHT.set(in_flight);
    let _ = CIRCUIT_STATE.set(circuit_state);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ITEMS_TOTAL.set(items_total);

    Ok(())
}

/// Export all metrics in Prometheus text format.
///
/// Returns an empty string if metrics were never initialized.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Records one attempt's outcome and latency.
pub fn record_attempt(endpoint: &str, outcome: &str, latency: Duration) {
    if let Some(counter) = ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[endpoint, outcome]).inc();
    }
    if let Some(histogram) = ATTEMPT_LATENCY.get() {
        histogram
            .with_label_values(&[endpoint])
            .observe(latency.as_secs_f64());
    }
}

/// Adjusts the in-flight gauge for an endpoint.
pub fn in_flight_delta(endpoint: &str, delta: i64) {
    if let Some(gauge) = IN_FLIGHT.get() {
        gauge.with_label_values(&[endpoint]).add(delta as f64);
    }
}

/// Publishes an endpoint's circuit state.
pub fn set_circuit_state(endpoint: &str, state: CircuitState) {
    if let Some(gauge) = CIRCUIT_STATE.get() {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        gauge.with_label_values(&[endpoint]).set(value);
    }
}

/// Publishes the retry queue depth.
pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as f64);
    }
}

/// Records one terminal item outcome.
pub fn record_item(outcome: &str) {
    record_items(outcome, 1);
}

/// Records several terminal item outcomes at once.
pub fn record_items(outcome: &str, count: usize) {
    if let Some(counter) = ITEMS_TOTAL.get() {
        counter
            .with_label_values(&[outcome])
            .inc_by(count as f64);
    }
}
