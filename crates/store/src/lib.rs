//! Persistence for job records and cached predictions.
//!
//! Both stores sit on an [`object_store::ObjectStore`], so the same code runs
//! against a local directory shared between processes or an in-memory store
//! in tests. Every store round-trip is bounded by a configurable timeout.

use std::future::Future;
use std::time::Duration;

mod job;
mod prediction;

pub use job::{JobMetrics, JobRecord, JobStatus, JobStore};
pub use prediction::{CacheEntry, PredictionCache, PredictionResult, fingerprint};

/// Errors raised by the stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("job {job_id} is already {status} and cannot be overwritten")]
    TerminalRecord { job_id: String, status: JobStatus },

    #[error("prediction value {0} is not finite and cannot be cached")]
    NonFinitePrediction(f64),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Runs `operation` and fails with [`StoreError::Timeout`] if it takes longer
/// than `timeout`.
async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| StoreError::Timeout { operation, timeout })?
}
