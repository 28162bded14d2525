//! End-to-end training pipeline run by every job.

use std::path::PathBuf;
use std::sync::Arc;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use config::Config;
use features::{
    DEFAULT_WINDOW_SIZE, DataSource, FEATURE_COLUMNS, FEATURE_COUNT, FeatureError, SYNTHETIC_SAMPLES,
    ScalerState, SequenceWindower,
};
use ml_model::{
    EvaluationMetrics, ExperimentTracker, ModelConfig, Trainer, TrackingError, TrackingRun,
    TrainingError,
};
use tracing::info;

/// Backend used for training.
pub type TrainBackend = Autodiff<NdArray>;

/// Share of sequences used for training; the rest is held out for evaluation.
pub const TRAIN_RATIO: f64 = 0.8;

/// Name of the fitted scaler artifact logged for every run.
pub const SCALER_ARTIFACT: &str = "scaler.json";

/// Default mini-batch size.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Errors raised by the pipeline. Each ends the job as `failed`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("failed to serialize scaler: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("training task aborted: {0}")]
    Aborted(String),
}

/// Settings shared by every pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// CSV with raw readings; synthetic data is generated when missing.
    pub data_path: Option<PathBuf>,
    /// Rows of synthetic data.
    pub synthetic_samples: usize,
    /// Seed for synthetic data and shuffling.
    pub seed: u64,
    pub window_size: usize,
    pub batch_size: usize,
    pub model: ModelConfig,
    /// Experiment the runs are tracked under.
    pub experiment_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            synthetic_samples: SYNTHETIC_SAMPLES,
            seed: 42,
            window_size: DEFAULT_WINDOW_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            model: ModelConfig::default(),
            experiment_name: String::from("Base_LSTM"),
        }
    }
}

impl PipelineConfig {
    /// Takes data location, window and experiment from the app configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_path: config.data_path.clone(),
            window_size: config.window_size,
            experiment_name: config.experiment_name.clone(),
            ..Self::default()
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub run_id: String,
    pub final_loss: f32,
    pub metrics: EvaluationMetrics,
}

/// Ingest, scale, window, split, train and evaluate.
#[derive(Debug, Clone)]
pub struct TrainingPipeline {
    config: Arc<PipelineConfig>,
    tracker: ExperimentTracker,
}

impl TrainingPipeline {
    #[must_use]
    pub fn new(config: PipelineConfig, tracker: ExperimentTracker) -> Self {
        Self {
            config: Arc::new(config),
            tracker,
        }
    }

    /// Tracker the runs are written to.
    #[must_use]
    pub const fn tracker(&self) -> &ExperimentTracker {
        &self.tracker
    }

    /// Pipeline settings.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the whole pipeline for `epochs` epochs.
    ///
    /// The CPU-bound part runs on the blocking pool; the tracked run is only
    /// written to the store once training and evaluation have succeeded.
    ///
    /// # Errors
    ///
    /// Returns the first error of any stage. A panic on the blocking pool is
    /// reported as `Aborted`.
    pub async fn run(&self, epochs: usize) -> Result<PipelineOutput, PipelineError> {
        let config = Arc::clone(&self.config);
        let mut run = self.tracker.start_run(&config.experiment_name);

        let (run, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = fit(&config, epochs, &mut run);
            (run, outcome)
        })
        .await
        .map_err(|e| PipelineError::Aborted(e.to_string()))?;

        let (final_loss, metrics) = outcome?;
        let record = self.tracker.finish(run).await?;

        Ok(PipelineOutput {
            run_id: record.run_id,
            final_loss,
            metrics,
        })
    }
}

fn fit(
    config: &PipelineConfig,
    epochs: usize,
    run: &mut TrackingRun,
) -> Result<(f32, EvaluationMetrics), PipelineError> {
    let table = DataSource::new(config.data_path.clone())
        .with_synthetic_samples(config.synthetic_samples)
        .with_seed(config.seed)
        .load()?;

    let mut scaler = ScalerState::new(FEATURE_COLUMNS);
    let scaled = scaler.fit_transform(&table)?;
    let sequences = SequenceWindower::new(config.window_size).create_sequences(&scaled)?;
    let (train, test) = sequences.split_at_ratio(TRAIN_RATIO);

    info!(
        rows = table.len(),
        train = train.len(),
        test = test.len(),
        "Prepared sequences"
    );

    run.log_param("rows", table.len());
    run.log_param("train_ratio", TRAIN_RATIO);
    run.log_artifact(SCALER_ARTIFACT, serde_json::to_vec_pretty(&scaler)?);

    let mut trainer =
        Trainer::<TrainBackend>::new(NdArrayDevice::default(), FEATURE_COUNT, config.model.clone())?
            .with_seed(config.seed);
    let output = trainer.train(&train, epochs, config.batch_size, run)?;
    let metrics = trainer.evaluate(&test)?;

    run.log_metric("mse", metrics.mse, 0);
    run.log_metric("mae", metrics.mae, 0);

    info!(
        run_id = %output.run_id,
        final_loss = output.final_loss,
        mse = metrics.mse,
        mae = metrics.mae,
        "Training pipeline finished"
    );

    Ok((output.final_loss, metrics))
}

#[cfg(test)]
pub(crate) mod tests {
    use object_store::memory::InMemory;

    use super::*;

    /// Small enough to train in a debug build within a second or two.
    pub(crate) fn small_config() -> PipelineConfig {
        PipelineConfig {
            synthetic_samples: 200,
            window_size: 8,
            batch_size: 32,
            model: ModelConfig {
                hidden_size: 8,
                num_layers: 1,
                learning_rate: 1e-2,
            },
            experiment_name: String::from("test"),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pipeline_tracks_run() {
        let tracker = ExperimentTracker::new(Arc::new(InMemory::new()));
        let pipeline = TrainingPipeline::new(small_config(), tracker.clone());

        let output = pipeline.run(1).await.expect("pipeline");
        assert!(output.metrics.mse >= 0.0);
        assert!(output.metrics.mae >= 0.0);

        let record = tracker.load_run("test", &output.run_id).await.expect("run");
        assert_eq!(record.params.get("window_size"), Some(&serde_json::json!(8)));
        assert_eq!(record.metrics.get("train_loss").map(Vec::len), Some(1));
        assert!(record.artifacts.contains(&SCALER_ARTIFACT.to_string()));
        assert!(record.artifacts.contains(&ml_model::MODEL_ARTIFACT.to_string()));
    }

    #[tokio::test]
    async fn test_pipeline_fails_on_short_series() {
        let config = PipelineConfig {
            synthetic_samples: 5,
            ..small_config()
        };
        let pipeline = TrainingPipeline::new(config, ExperimentTracker::new(Arc::new(InMemory::new())));

        let result = pipeline.run(1).await;
        assert!(matches!(
            result,
            Err(PipelineError::Feature(FeatureError::InsufficientData { rows: 5, window: 8 }))
        ));
    }
}
