//! Training job records.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use object_store::path::Path as ObjectStorePath;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, StoreError, with_timeout};

/// Lifecycle state of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns true for states that are never left again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Held-out metrics of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub mse: f64,
    pub mae: f64,
}

/// Persisted state of a training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<JobMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly submitted job.
    #[must_use]
    pub fn running(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Running,
            metrics: None,
            run_id: None,
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Transitions to `completed` with the job's results.
    #[must_use]
    pub fn completed(self, metrics: JobMetrics, run_id: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            metrics: Some(metrics),
            run_id: Some(run_id.into()),
            error: None,
            finished_at: Some(Utc::now()),
            ..self
        }
    }

    /// Transitions to `failed` with an error message.
    #[must_use]
    pub fn failed(self, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            metrics: None,
            error: Some(error.into()),
            finished_at: Some(Utc::now()),
            ..self
        }
    }
}

/// Key-value store of [`JobRecord`]s under `jobs/{job_id}.json`.
#[derive(Debug, Clone)]
pub struct JobStore {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl JobStore {
    /// Creates a job store over `store`, bounding every call by `timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Writes a record, replacing the previous one.
    ///
    /// A record that already reached a terminal state is never replaced. The
    /// check and the write are two store calls, so this relies on each job id
    /// having a single writer.
    ///
    /// # Errors
    ///
    /// Returns `TerminalRecord` if the stored record is terminal, `Timeout`
    /// if the store does not answer in time, or the underlying store error.
    pub async fn set(&self, record: &JobRecord) -> Result<()> {
        with_timeout(self.timeout, "job set", async {
            if let Some(existing) = self.read(&record.job_id).await? {
                if existing.status.is_terminal() {
                    return Err(StoreError::TerminalRecord {
                        job_id: existing.job_id,
                        status: existing.status,
                    });
                }
            }

            let json = serde_json::to_vec(record)?;
            self.store.put(&job_path(&record.job_id), json.into()).await?;

            debug!(job_id = %record.job_id, status = %record.status, "Stored job record");
            Ok(())
        })
        .await
    }

    /// Reads a record, or `None` if the job is unknown.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the store does not answer in time, or the
    /// underlying store/serialization error.
    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        with_timeout(self.timeout, "job get", self.read(job_id)).await
    }

    async fn read(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let bytes = match self.store.get(&job_path(job_id)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

fn job_path(job_id: &str) -> ObjectStorePath {
    ObjectStorePath::from(format!("jobs/{job_id}.json"))
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn store() -> JobStore {
        JobStore::new(Arc::new(InMemory::new()), Duration::from_secs(2))
    }

    fn metrics() -> JobMetrics {
        JobMetrics { mse: 0.5, mae: 0.25 }
    }

    #[tokio::test]
    async fn test_get_unknown_job() {
        assert_eq!(store().get("job_missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_running_then_completed() {
        let store = store();
        let running = JobRecord::running("job_1");
        store.set(&running).await.expect("set running");
        assert_eq!(store.get("job_1").await.expect("get"), Some(running.clone()));

        let completed = running.completed(metrics(), "run123");
        store.set(&completed).await.expect("set completed");

        let loaded = store.get("job_1").await.expect("get").expect("present");
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.metrics, Some(metrics()));
        assert_eq!(loaded.run_id.as_deref(), Some("run123"));
        assert!(loaded.error.is_none());
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_overwritten() {
        let store = store();
        let failed = JobRecord::running("job_2").failed("boom");
        store.set(&failed).await.expect("set failed");

        let result = store.set(&JobRecord::running("job_2")).await;
        assert!(matches!(
            result,
            Err(StoreError::TerminalRecord {
                status: JobStatus::Failed,
                ..
            })
        ));

        let loaded = store.get("job_2").await.expect("get").expect("present");
        assert_eq!(loaded.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let record = JobRecord::running("job_3");
        let json = serde_json::to_value(&record).expect("serialize");

        assert_eq!(json["status"], "running");
        assert!(json.get("metrics").is_none());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
