//! Request metrics in the Prometheus text format.

use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::api::ApiError;

/// Per-handler request counts and latencies, registered on a private registry.
#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl ApiMetrics {
    /// Creates and registers the collectors.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector description is invalid.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("api_requests_total", "Handled API requests"),
            &["handler", "status"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("api_request_duration_seconds", "API request latency"),
            &["handler"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            requests,
            latency,
        })
    }

    /// Records one request of `handler` that started at `started`.
    pub fn observe<T>(&self, handler: &str, started: Instant, outcome: &Result<T, ApiError>) {
        let status = outcome.as_ref().map_or_else(ApiError::status_code, |_| 200);
        self.requests
            .with_label_values(&[handler, &status.to_string()])
            .inc();
        self.latency
            .with_label_values(&[handler])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Number of requests recorded for `handler` with `status`.
    #[must_use]
    pub fn request_count(&self, handler: &str, status: u16) -> u64 {
        self.requests
            .with_label_values(&[handler, &status.to_string()])
            .get()
    }

    /// Renders every collector in the text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_by_status() {
        let metrics = ApiMetrics::new().expect("metrics");

        metrics.observe("predict", Instant::now(), &Ok::<_, ApiError>(()));
        metrics.observe("predict", Instant::now(), &Err::<(), _>(ApiError::RateLimited));
        metrics.observe("predict", Instant::now(), &Err::<(), _>(ApiError::RateLimited));

        assert_eq!(metrics.request_count("predict", 200), 1);
        assert_eq!(metrics.request_count("predict", 429), 2);

        let text = metrics.render().expect("render");
        assert!(text.contains(r#"api_requests_total{handler="predict",status="429"} 2"#));
        assert!(text.contains("api_request_duration_seconds_count"));
    }
}
