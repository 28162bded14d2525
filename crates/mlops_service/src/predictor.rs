//! Prediction backends.

use std::sync::Mutex;

use burn::backend::NdArray;
use burn::backend::ndarray::NdArrayDevice;
use features::{FeatureError, ScalerState, TARGET_COLUMN};
use ml_model::{
    ExperimentTracker, ForecastModel, MODEL_ARTIFACT, ModelConfig, RunRecord, SequenceBatcher,
    TrackingError, TrainingError, load_checkpoint, output_to_vec,
};
use tracing::{debug, info};

use crate::pipeline::SCALER_ARTIFACT;

/// Backend used for inference.
pub type InferenceBackend = NdArray;

/// Errors raised while loading a predictor or predicting.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("expected {expected} features per step, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("input value {0} is outside the range the model accepts")]
    OutOfRange(f64),

    #[error("prediction for sequence {0} is not a finite number")]
    NonFinitePrediction(usize),

    #[error("run is missing parameter `{0}`")]
    MissingParam(&'static str),

    #[error("model is unavailable")]
    Poisoned,

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("failed to decode run artifact: {0}")]
    Decode(String),
}

/// Maps a batch of sequences to one forecast per sequence.
///
/// Inputs are `[sequence][step][feature]` in raw units.
pub trait Predictor: Send + Sync {
    /// Predicts one value per sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the input shape does not fit the predictor.
    fn predict(&self, features: &[Vec<Vec<f64>>]) -> Result<Vec<f64>, PredictError>;
}

/// Half the mean of every value in the sequence. Served when no trained run
/// is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselinePredictor;

impl Predictor for BaselinePredictor {
    fn predict(&self, features: &[Vec<Vec<f64>>]) -> Result<Vec<f64>, PredictError> {
        Ok(features
            .iter()
            .map(|sequence| {
                // Running mean: a plain sum overflows for values near f64::MAX.
                let (mean, _) = sequence
                    .iter()
                    .flatten()
                    .fold((0.0_f64, 0_usize), |(mean, count), &v| {
                        let count = count + 1;
                        (mean + (v - mean) / count as f64, count)
                    });
                0.5 * mean
            })
            .collect())
    }
}

/// Serves the network and scaler of a tracked training run.
#[derive(Debug)]
pub struct ModelPredictor {
    run_id: String,
    model: Mutex<ForecastModel<InferenceBackend>>,
    scaler: ScalerState,
    feature_count: usize,
    device: NdArrayDevice,
}

impl ModelPredictor {
    /// Loads params, scaler and weights of `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run or one of its artifacts is missing or
    /// does not decode.
    pub async fn load(
        tracker: &ExperimentTracker,
        experiment: &str,
        run_id: &str,
    ) -> Result<Self, PredictError> {
        let record = tracker.load_run(experiment, run_id).await?;
        let feature_count = param(&record, "input_dim")?;
        let config = ModelConfig {
            hidden_size: param(&record, "hidden_size")?,
            num_layers: param(&record, "num_layers")?,
            learning_rate: record
                .params
                .get("learning_rate")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or_default(),
        };

        let scaler_bytes = tracker
            .load_artifact(experiment, run_id, SCALER_ARTIFACT)
            .await?;
        let scaler = ScalerState::from_json(&scaler_bytes)?;
        if !scaler.is_fitted() {
            return Err(FeatureError::NotFitted.into());
        }

        config.validate()?;

        let weights = tracker.load_artifact(experiment, run_id, MODEL_ARTIFACT).await?;
        let device = NdArrayDevice::default();
        let model = load_checkpoint::<InferenceBackend>(weights.to_vec(), feature_count, &config, &device)
            .map_err(|e| PredictError::Decode(e.to_string()))?;

        info!(experiment, run_id, feature_count, "Loaded model predictor");

        Ok(Self {
            run_id: run_id.to_string(),
            model: Mutex::new(model),
            scaler,
            feature_count,
            device,
        })
    }

    /// Run the model was loaded from.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Predictor for ModelPredictor {
    fn predict(&self, features: &[Vec<Vec<f64>>]) -> Result<Vec<f64>, PredictError> {
        let steps = features.first().map_or(0, Vec::len);
        if features.is_empty() || steps == 0 {
            return Ok(Vec::new());
        }

        let mut flat = Vec::with_capacity(features.len() * steps * self.feature_count);
        for sequence in features {
            if sequence.len() != steps {
                return Err(PredictError::ShapeMismatch {
                    expected: steps,
                    actual: sequence.len(),
                });
            }
            for step in sequence {
                if step.len() != self.feature_count {
                    return Err(PredictError::ShapeMismatch {
                        expected: self.feature_count,
                        actual: step.len(),
                    });
                }
                let raw = step
                    .iter()
                    .map(|&v| {
                        let narrowed = v as f32;
                        if narrowed.is_finite() {
                            Ok(narrowed)
                        } else {
                            Err(PredictError::OutOfRange(v))
                        }
                    })
                    .collect::<Result<Vec<f32>, _>>()?;
                flat.extend(self.scaler.transform_row(&raw)?);
            }
        }

        let batcher =
            SequenceBatcher::<InferenceBackend>::new(self.device.clone(), steps, self.feature_count);
        let output = {
            let model = self.model.lock().map_err(|_| PredictError::Poisoned)?;
            model.forward(batcher.inputs(&flat))
        };

        let scaled = output_to_vec(output)?;
        debug!(run_id = %self.run_id, sequences = scaled.len(), "Model prediction");

        scaled
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let raw = self.scaler.inverse_transform_value(TARGET_COLUMN, v)?;
                if raw.is_finite() {
                    Ok(f64::from(raw))
                } else {
                    Err(PredictError::NonFinitePrediction(i))
                }
            })
            .collect()
    }
}

fn param(record: &RunRecord, key: &'static str) -> Result<usize, PredictError> {
    record
        .params
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or(PredictError::MissingParam(key))
}
