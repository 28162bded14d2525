//! Background training jobs.
//!
//! A job is written as `running`, trained on the blocking pool, and written
//! exactly once more with its terminal state. Callers get a [`JobHandle`]
//! back immediately; the API layer detaches it, tests and the CLI await it.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use store::{JobMetrics, JobRecord, JobStore, StoreError};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::TrainingPipeline;

/// Highest timestamp handed out as a job id in this process.
static LAST_JOB_MICROS: AtomicU64 = AtomicU64::new(0);

/// Errors raised by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("epochs must be positive")]
    InvalidEpochs,

    #[error("job {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Returns `job_{unix_micros}`, bumped past the previous id when two calls
/// land in the same microsecond.
///
/// Ids are unique within a process. Two processes sharing a store can still
/// collide.
#[must_use]
pub fn next_job_id() -> String {
    let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default();
    let mut last = LAST_JOB_MICROS.load(Ordering::Relaxed);

    loop {
        let candidate = now.max(last + 1);
        match LAST_JOB_MICROS.compare_exchange_weak(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("job_{candidate}"),
            Err(actual) => last = actual,
        }
    }
}

/// A submitted job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    task: JoinHandle<JobRecord>,
}

impl JobHandle {
    /// Id of the submitted job.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Waits for the terminal write and returns the terminal record.
    ///
    /// # Errors
    ///
    /// Returns `Task` if the job task was cancelled or panicked.
    pub async fn wait(self) -> Result<JobRecord, OrchestratorError> {
        Ok(self.task.await?)
    }

    /// Lets the job run to completion without waiting for it.
    #[must_use]
    pub fn detach(self) -> String {
        self.job_id
    }
}

/// Submits training jobs and reports their status.
#[derive(Debug, Clone)]
pub struct JobOrchestrator {
    jobs: JobStore,
    pipeline: TrainingPipeline,
}

impl JobOrchestrator {
    #[must_use]
    pub const fn new(jobs: JobStore, pipeline: TrainingPipeline) -> Self {
        Self { jobs, pipeline }
    }

    /// Records a new `running` job and starts it in the background.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEpochs` for zero epochs, or the store error if the
    /// initial record cannot be written (nothing is started in that case).
    pub async fn submit(&self, epochs: usize) -> Result<JobHandle, OrchestratorError> {
        if epochs == 0 {
            return Err(OrchestratorError::InvalidEpochs);
        }

        let job_id = next_job_id();
        let record = JobRecord::running(job_id.clone());
        self.jobs.set(&record).await?;

        info!(job_id = %job_id, epochs, "Training job submitted");

        let jobs = self.jobs.clone();
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move {
            let record = match pipeline.run(epochs).await {
                Ok(output) => {
                    info!(
                        job_id = %record.job_id,
                        run_id = %output.run_id,
                        mse = output.metrics.mse,
                        mae = output.metrics.mae,
                        "Training job completed"
                    );
                    let metrics = JobMetrics {
                        mse: output.metrics.mse,
                        mae: output.metrics.mae,
                    };
                    record.completed(metrics, output.run_id)
                }
                Err(e) => {
                    error!(job_id = %record.job_id, error = %e, "Training job failed");
                    record.failed(e.to_string())
                }
            };

            if let Err(e) = jobs.set(&record).await {
                error!(job_id = %record.job_id, error = %e, "Failed to store terminal job state");
            }

            record
        });

        Ok(JobHandle { job_id, task })
    }

    /// Reads the current record of a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job id, or the store error.
    pub async fn status(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use ml_model::ExperimentTracker;
    use object_store::memory::InMemory;
    use store::JobStatus;

    use super::*;
    use crate::pipeline::PipelineConfig;
    use crate::pipeline::tests::small_config;

    fn orchestrator_with_jobs(config: PipelineConfig) -> (JobOrchestrator, JobStore) {
        let store = Arc::new(InMemory::new());
        let jobs = JobStore::new(store.clone(), Duration::from_secs(2));
        let orchestrator = JobOrchestrator::new(
            jobs.clone(),
            TrainingPipeline::new(config, ExperimentTracker::new(store)),
        );
        (orchestrator, jobs)
    }

    fn orchestrator(config: PipelineConfig) -> JobOrchestrator {
        orchestrator_with_jobs(config).0
    }

    #[test]
    fn test_job_ids_are_unique_and_increasing() {
        let ids: Vec<String> = (0..1000).map(|_| next_job_id()).collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        let micros: Vec<u64> = ids
            .iter()
            .map(|id| id.trim_start_matches("job_").parse().expect("numeric"))
            .collect();
        assert!(micros.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_submit_then_complete() {
        let orchestrator = orchestrator(small_config());

        let handle = orchestrator.submit(2).await.expect("submit");
        let job_id = handle.job_id().to_string();
        assert!(job_id.starts_with("job_"));

        let terminal = handle.wait().await.expect("job task");
        assert_eq!(terminal.status, JobStatus::Completed);

        let stored = orchestrator.status(&job_id).await.expect("status");
        assert_eq!(stored, terminal);
        let metrics = stored.metrics.expect("metrics");
        assert!(metrics.mse >= 0.0);
        assert!(metrics.mae >= 0.0);
        assert!(stored.run_id.is_some());
    }

    // On the current-thread runtime the spawned job cannot start before this
    // task yields, so the first status read sees the initial record.
    #[tokio::test]
    async fn test_status_is_running_until_terminal_write() {
        let config = PipelineConfig {
            synthetic_samples: 400,
            ..small_config()
        };
        let (orchestrator, jobs) = orchestrator_with_jobs(config);

        let handle = orchestrator.submit(3).await.expect("submit");
        let job_id = handle.job_id().to_string();

        let initial = orchestrator.status(&job_id).await.expect("status");
        assert_eq!(initial.status, JobStatus::Running);
        assert_eq!(initial.job_id, job_id);
        assert!(initial.metrics.is_none());
        assert!(initial.run_id.is_none());
        assert!(initial.error.is_none());

        let terminal = handle.wait().await.expect("job task");
        assert_eq!(terminal.status, JobStatus::Completed);
        assert_eq!(orchestrator.status(&job_id).await.expect("status"), terminal);

        let overwrite = jobs.set(&JobRecord::running(job_id.clone())).await;
        assert!(matches!(
            overwrite,
            Err(StoreError::TerminalRecord { status: JobStatus::Completed, .. })
        ));
        assert_eq!(orchestrator.status(&job_id).await.expect("status"), terminal);
    }

    #[tokio::test]
    async fn test_failed_job_records_error() {
        let config = PipelineConfig {
            synthetic_samples: 3,
            ..small_config()
        };
        let orchestrator = orchestrator(config);

        let handle = orchestrator.submit(1).await.expect("submit");
        let job_id = handle.job_id().to_string();
        handle.wait().await.expect("job task");

        let stored = orchestrator.status(&job_id).await.expect("status");
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.metrics.is_none());
        assert!(stored.error.expect("error").contains("insufficient data"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let result = orchestrator(small_config()).status("job_0").await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(id)) if id == "job_0"));
    }

    #[tokio::test]
    async fn test_zero_epochs_rejected() {
        let result = orchestrator(small_config()).submit(0).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidEpochs)));
    }
}
