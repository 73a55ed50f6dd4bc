//! Inference backend abstraction and HTTP implementation.
//!
//! The dispatch layer talks to endpoints through the [`InferenceBackend`]
//! trait so that tests can substitute scripted backends. The production
//! implementation, [`HttpBackend`], issues
//! `GET {base}?PMID=<id>&sponsor=<sponsor>&drugname=<INN(Brand)>` requests
//! and decodes the JSON body.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::config::DispatchConfig;
use crate::error::FetchError;
use crate::work::{SearchContext, WorkItem};

/// Result of a successful health probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    /// Round-trip latency of the probe request.
    pub latency: Duration,
    /// HTTP status the endpoint answered with.
    pub status: u16,
}

/// Trait for backends that can produce an inference result for a work item.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Fetch one inference result from one endpoint for one item.
    ///
    /// Implementations perform a single request with no internal retries;
    /// retry policy lives entirely in the dispatch layer.
    async fn fetch(
        &self,
        base_url: &str,
        item: &WorkItem,
        context: &SearchContext,
    ) -> Result<serde_json::Value, FetchError>;

    /// Issue a lightweight reachability probe against an endpoint.
    ///
    /// A probe succeeds on any 2xx. Validation-style 4xx responses are
    /// returned as [`FetchError::Client`]; the caller decides whether those
    /// count as alive.
    async fn probe(&self, base_url: &str) -> Result<ProbeReport, FetchError>;
}

/// HTTP backend for real inference endpoints.
pub struct HttpBackend {
    /// HTTP client for inference requests, carrying the hard deadline.
    client: Client,
    /// Hard deadline for inference requests, kept for error reporting.
    request_timeout: Duration,
    /// Shorter deadline applied to health probes.
    probe_timeout: Duration,
}

impl HttpBackend {
    /// Creates an HTTP backend from the service configuration.
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(config.request_timeout)
                .user_agent(config.user_agent.clone())
                .build()
                .expect("Failed to build HTTP client"),
            request_timeout: config.request_timeout,
            probe_timeout: config.probe_timeout,
        }
    }

    /// Builds the inference request URL for one item.
    fn build_url(base_url: &str, item: &WorkItem, context: &SearchContext) -> String {
        format!(
            "{}?PMID={}&sponsor={}&drugname={}",
            base_url.trim_end_matches('/'),
            urlencoding::encode(&item.pmid),
            urlencoding::encode(&context.sponsor),
            urlencoding::encode(&context.drug_name()),
        )
    }

    /// Maps a transport-level reqwest error to the fetch taxonomy.
    fn map_transport_error(e: reqwest::Error, deadline: Duration) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                seconds: deadline.as_secs(),
            }
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn fetch(
        &self,
        base_url: &str,
        item: &WorkItem,
        context: &SearchContext,
    ) -> Result<serde_json::Value, FetchError> {
        let url = Self::build_url(base_url, item, context);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Self::map_transport_error(e, self.request_timeout))?;

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_server_error() {
            return Err(FetchError::Server {
                status: status_code,
            });
        }

        if status.is_client_error() {
            // Keep a bounded slice of the body for the error message;
            // validation responses can be verbose.
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(200).collect();
            return Err(FetchError::Client {
                status: status_code,
                message,
            });
        }

        // 2xx: decode the body, treating undecodable bodies as retryable.
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn probe(&self, base_url: &str) -> Result<ProbeReport, FetchError> {
        let start = Instant::now();

        let response = self
            .client
            .get(base_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Self::map_transport_error(e, self.probe_timeout))?;

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_server_error() {
            return Err(FetchError::Server {
                status: status_code,
            });
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(200).collect();
            return Err(FetchError::Client {
                status: status_code,
                message,
            });
        }

        Ok(ProbeReport {
            latency: start.elapsed(),
            status: status_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DispatchConfig {
        DispatchConfig::new(vec!["http://localhost:9".to_string()])
    }

    #[test]
    fn test_build_url_encodes_parameters() {
        let item = WorkItem::new("38011234");
        let ctx = SearchContext::new("Acme Pharma", "adalimumab").with_brand("Humira");

        let url = HttpBackend::build_url("http://inference.local/v1", &item, &ctx);

        assert!(url.starts_with("http://inference.local/v1?PMID=38011234"));
        assert!(url.contains("sponsor=Acme%20Pharma"));
        assert!(url.contains("drugname=adalimumab%28Humira%29"));
    }

    #[test]
    fn test_build_url_strips_trailing_slash() {
        let item = WorkItem::new("1");
        let ctx = SearchContext::new("s", "d");

        let url = HttpBackend::build_url("http://inference.local/v1/", &item, &ctx);
        assert!(url.starts_with("http://inference.local/v1?"));
    }

    #[tokio::test]
    async fn test_fetch_connection_error() {
        // Port 9 (discard) is closed on any sane machine
        let backend = HttpBackend::new(&test_config());
        let item = WorkItem::new("1");
        let ctx = SearchContext::new("s", "d");

        let result = backend.fetch("http://127.0.0.1:9", &item, &ctx).await;
        assert!(matches!(result, Err(FetchError::Connection(_))));
    }

    #[tokio::test]
    async fn test_probe_connection_error() {
        let backend = HttpBackend::new(&test_config());

        let result = backend.probe("http://127.0.0.1:9").await;
        assert!(result.is_err());
    }
}
