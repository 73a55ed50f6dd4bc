//! The dispatch service facade.
//!
//! `DispatchService` owns every subsystem: the endpoint registry, the
//! executor, the batch coordinator, the durable retry queue, and the
//! health monitor. It is constructed once at process start and passed by
//! reference to callers; there is no global state, so tests run multiple
//! independent instances side by side.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::backend::{HttpBackend, InferenceBackend};
use crate::config::{ConfigError, DispatchConfig};
use crate::dispatch::{BatchCoordinator, EndpointSelector};
use crate::endpoint::{
    health, EndpointRegistry, EndpointSnapshot, HealthMonitor, ProbeOutcome,
};
use crate::error::{DispatchError, QueueError};
use crate::executor::RequestExecutor;
use crate::retry::{ManualRetryReport, QueueStatus, RetryPolicy, RetryQueue};
use crate::storage::JobStore;
use crate::work::{BatchOptions, BatchResult, SearchContext, WorkItem};

/// Pool health report returned by [`DispatchService::health_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Per-endpoint snapshots.
    pub endpoints: Vec<EndpointSnapshot>,
    /// Endpoints whose circuit is not open.
    pub healthy_count: usize,
    /// Total configured endpoints.
    pub total_count: usize,
}

/// Resilient dispatch service over a pool of inference endpoints.
pub struct DispatchService {
    config: DispatchConfig,
    registry: Arc<EndpointRegistry>,
    backend: Arc<dyn InferenceBackend>,
    coordinator: Arc<BatchCoordinator>,
    queue: Arc<RetryQueue>,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl DispatchService {
    /// Creates a service over real HTTP endpoints.
    ///
    /// Validates the configuration and recovers any retry jobs persisted
    /// by a previous run. Background tasks do not run until
    /// [`DispatchService::start`].
    pub async fn new(config: DispatchConfig) -> Result<Self, ConfigError> {
        let backend: Arc<dyn InferenceBackend> = Arc::new(HttpBackend::new(&config));
        Self::with_backend(config, backend).await
    }

    /// Creates a service over an arbitrary backend implementation.
    ///
    /// Used by tests to inject scripted backends; production code uses
    /// [`DispatchService::new`].
    pub async fn with_backend(
        config: DispatchConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(EndpointRegistry::new(&config));
        let selector = Arc::new(EndpointSelector::new(Arc::clone(&registry), &config));
        let executor = Arc::new(RequestExecutor::new(
            Arc::clone(&backend),
            config.request_timeout,
        ));
        let coordinator = Arc::new(BatchCoordinator::new(
            selector,
            executor,
            RetryPolicy::from_config(&config),
            config.effective_batch_size(),
            config.max_batch_size,
        ));
        let store = Arc::new(JobStore::new(&config.queue_dir));
        let queue = Arc::new(RetryQueue::new(
            Arc::clone(&coordinator),
            store,
            &config,
        ));

        let recovered = queue.recover().await;
        info!(
            endpoints = config.endpoints.len(),
            recovered_jobs = recovered,
            "Dispatch service constructed"
        );

        Ok(Self {
            config,
            registry,
            backend,
            coordinator,
            queue,
            monitor: Mutex::new(None),
        })
    }

    /// Starts the background health monitor and retry sweeper.
    pub fn start(&self) {
        let monitor = HealthMonitor::start(
            Arc::clone(&self.registry),
            self.config.health_check_interval,
        );
        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(monitor);
        self.queue.start();
        info!("Dispatch service started");
    }

    /// Processes a work set through the immediate phase.
    ///
    /// Synchronous with respect to the immediate passes; items that
    /// survive them are queued for background retry and reported in
    /// `BatchResult::queued`. When the entire pool is unavailable and not
    /// a single request could be issued, the items are still queued and
    /// [`DispatchError::NoEndpointsAvailable`] is returned so the caller
    /// can distinguish a dead pool from a slow one.
    pub async fn submit_batch(
        &self,
        items: Vec<WorkItem>,
        context: SearchContext,
        options: BatchOptions,
    ) -> Result<BatchResult, DispatchError> {
        if items.is_empty() {
            return Ok(BatchResult::default());
        }

        let summary = self.coordinator.process(items, &context, &options).await;

        let nothing_issued = !summary.issued_any
            && summary.successes.is_empty()
            && summary.failures.is_empty();

        let queued = if summary.unresolved.is_empty() {
            None
        } else {
            Some(self.queue.enqueue(summary.unresolved, context).await)
        };

        if nothing_issued {
            error!(
                queued_items = queued.as_ref().map_or(0, |q| q.pmids.len()),
                "No endpoints available; entire batch deferred to retry queue"
            );
            return Err(DispatchError::NoEndpointsAvailable);
        }

        Ok(BatchResult {
            successes: summary.successes,
            failures: summary.failures,
            duplicates: summary.duplicates,
            queued,
            duration: summary.duration,
        })
    }

    /// Per-endpoint health snapshots plus pool counts.
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus {
            endpoints: self.registry.snapshot(),
            healthy_count: self.registry.available_count(),
            total_count: self.registry.total_count(),
        }
    }

    /// Active retry jobs and cumulative queue statistics.
    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Forces an immediate background pass for one retry job.
    pub async fn manual_retry(&self, job_id: Uuid) -> Result<ManualRetryReport, QueueError> {
        self.queue.manual_retry(job_id).await
    }

    /// Probes every endpoint and reports reachability.
    pub async fn test_connection(&self) -> Vec<ProbeOutcome> {
        health::probe_all(
            &self.registry,
            self.backend.as_ref(),
            self.config.probe_accept_validation_errors,
        )
        .await
    }

    /// Stops background tasks and persists queue state.
    pub async fn shutdown(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.queue.stop().await;
        info!("Dispatch service shut down");
    }

    /// The configuration the service was built with.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}
