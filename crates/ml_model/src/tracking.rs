//! Experiment tracking on top of an object store.
//!
//! A [`TrackingRun`] buffers params, metric history and artifacts in memory
//! while training runs on a blocking thread; [`ExperimentTracker::finish`]
//! flushes it. Layout inside the store:
//!
//! ```text
//! experiments/{experiment}/runs/{run_id}/run.json
//! experiments/{experiment}/runs/{run_id}/artifacts/{name}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use object_store::path::Path as ObjectStorePath;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Errors raised by the tracker.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("run {run_id} not found in experiment {experiment}")]
    RunNotFound { experiment: String, run_id: String },

    #[error("artifact {name} not found for run {run_id}")]
    ArtifactNotFound { run_id: String, name: String },

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One logged value of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub step: usize,
    pub value: f64,
}

/// Persisted summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub experiment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub params: BTreeMap<String, serde_json::Value>,
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    pub artifacts: Vec<String>,
}

/// An open run collecting params, metrics and artifacts.
#[derive(Debug, Clone)]
pub struct TrackingRun {
    record: RunRecord,
    artifacts: Vec<(String, Bytes)>,
}

impl TrackingRun {
    /// Identifier of this run.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }

    /// Experiment the run belongs to.
    #[must_use]
    pub fn experiment(&self) -> &str {
        &self.record.experiment
    }

    /// Records a parameter, replacing any previous value.
    pub fn log_param(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.record.params.insert(key.to_string(), value.into());
    }

    /// Appends a metric value at `step`.
    pub fn log_metric(&mut self, key: &str, value: f64, step: usize) {
        self.record
            .metrics
            .entry(key.to_string())
            .or_default()
            .push(MetricPoint { step, value });
    }

    /// Attaches an artifact, replacing one with the same name.
    pub fn log_artifact(&mut self, name: &str, data: impl Into<Bytes>) {
        self.artifacts.retain(|(existing, _)| existing != name);
        self.artifacts.push((name.to_string(), data.into()));
    }

    /// Logged parameters.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.record.params
    }

    /// History of one metric, in logging order.
    #[must_use]
    pub fn metric_history(&self, key: &str) -> &[MetricPoint] {
        self.record.metrics.get(key).map_or(&[], Vec::as_slice)
    }

    /// Names of the attached artifacts.
    pub fn artifact_names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.iter().map(|(name, _)| name.as_str())
    }
}

/// Params/metrics/artifact sink keyed by run id.
#[derive(Debug, Clone)]
pub struct ExperimentTracker {
    store: Arc<dyn ObjectStore>,
}

impl ExperimentTracker {
    /// Creates a tracker writing into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Opens a new run with a fresh id.
    #[must_use]
    pub fn start_run(&self, experiment: &str) -> TrackingRun {
        let run_id = Uuid::new_v4().simple().to_string();
        debug!(experiment, run_id = %run_id, "Started tracking run");

        TrackingRun {
            record: RunRecord {
                run_id,
                experiment: experiment.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                params: BTreeMap::new(),
                metrics: BTreeMap::new(),
                artifacts: Vec::new(),
            },
            artifacts: Vec::new(),
        }
    }

    /// Writes the run's artifacts, then its summary.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub async fn finish(&self, run: TrackingRun) -> Result<RunRecord, TrackingError> {
        let TrackingRun {
            mut record,
            artifacts,
        } = run;

        for (name, data) in artifacts {
            let path = artifact_path(&record.experiment, &record.run_id, &name);
            self.store.put(&path, data.into()).await?;
            record.artifacts.push(name);
        }

        record.finished_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&record)?;
        self.store
            .put(&run_path(&record.experiment, &record.run_id), json.into())
            .await?;

        info!(
            experiment = %record.experiment,
            run_id = %record.run_id,
            artifacts = record.artifacts.len(),
            "Tracking run finished"
        );

        Ok(record)
    }

    /// Reads a finished run's summary.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run was never finished.
    pub async fn load_run(&self, experiment: &str, run_id: &str) -> Result<RunRecord, TrackingError> {
        let bytes = match self.store.get(&run_path(experiment, run_id)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(TrackingError::RunNotFound {
                    experiment: experiment.to_string(),
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reads one artifact of a finished run.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactNotFound` if the run has no such artifact.
    pub async fn load_artifact(
        &self,
        experiment: &str,
        run_id: &str,
        name: &str,
    ) -> Result<Bytes, TrackingError> {
        match self.store.get(&artifact_path(experiment, run_id, name)).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => Err(TrackingError::ArtifactNotFound {
                run_id: run_id.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn run_dir(experiment: &str, run_id: &str) -> String {
    format!("experiments/{experiment}/runs/{run_id}")
}

fn run_path(experiment: &str, run_id: &str) -> ObjectStorePath {
    ObjectStorePath::from(format!("{}/run.json", run_dir(experiment, run_id)))
}

fn artifact_path(experiment: &str, run_id: &str, name: &str) -> ObjectStorePath {
    ObjectStorePath::from(format!("{}/artifacts/{name}", run_dir(experiment, run_id)))
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn tracker() -> ExperimentTracker {
        ExperimentTracker::new(Arc::new(InMemory::new()))
    }

    #[test]
    fn test_run_ids_are_unique() {
        let tracker = tracker();
        let a = tracker.start_run("exp");
        let b = tracker.start_run("exp");
        assert_ne!(a.run_id(), b.run_id());
    }

    #[test]
    fn test_buffers_params_and_metrics() {
        let mut run = tracker().start_run("exp");
        run.log_param("epochs", 3_usize);
        run.log_param("epochs", 4_usize);
        run.log_metric("train_loss", 0.5, 0);
        run.log_metric("train_loss", 0.25, 1);
        run.log_artifact("model.bin", vec![1_u8, 2]);
        run.log_artifact("model.bin", vec![3_u8]);

        assert_eq!(run.params().get("epochs"), Some(&serde_json::json!(4)));
        assert_eq!(
            run.metric_history("train_loss"),
            &[
                MetricPoint { step: 0, value: 0.5 },
                MetricPoint { step: 1, value: 0.25 }
            ]
        );
        assert!(run.metric_history("missing").is_empty());
        assert_eq!(run.artifact_names().collect::<Vec<_>>(), vec!["model.bin"]);
    }

    #[tokio::test]
    async fn test_finish_and_reload() {
        let tracker = tracker();
        let mut run = tracker.start_run("Base_LSTM");
        let run_id = run.run_id().to_string();
        run.log_param("hidden_size", 8_usize);
        run.log_metric("mse", 0.1, 0);
        run.log_artifact("model.bin", vec![9_u8, 8, 7]);

        let finished = tracker.finish(run).await.expect("finish");
        assert!(finished.finished_at.is_some());
        assert_eq!(finished.artifacts, vec!["model.bin".to_string()]);

        let loaded = tracker.load_run("Base_LSTM", &run_id).await.expect("load run");
        assert_eq!(loaded, finished);

        let artifact = tracker
            .load_artifact("Base_LSTM", &run_id, "model.bin")
            .await
            .expect("artifact");
        assert_eq!(artifact.as_ref(), &[9, 8, 7]);
    }

    #[tokio::test]
    async fn test_missing_run_and_artifact() {
        let tracker = tracker();

        assert!(matches!(
            tracker.load_run("exp", "nope").await,
            Err(TrackingError::RunNotFound { .. })
        ));
        assert!(matches!(
            tracker.load_artifact("exp", "nope", "model.bin").await,
            Err(TrackingError::ArtifactNotFound { .. })
        ));
    }
}
