//! ML model crate for energy consumption forecasting.
//!
//! This crate uses the Burn deep learning framework to define, train,
//! evaluate and serialize a recurrent network that predicts the next
//! reading of a time series from a window of scaled feature rows.

use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig};
use burn::prelude::*;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder, RecorderError};
use serde::{Deserialize, Serialize};

pub mod dataset;
pub mod tracking;
pub mod training;

pub use dataset::{SequenceBatch, SequenceBatcher, SequenceDataset, SequenceItem};
pub use tracking::{ExperimentTracker, MetricPoint, RunRecord, TrackingError, TrackingRun};
pub use training::{EvaluationMetrics, Trainer, TrainingOutput};

/// Name of the weights artifact logged for every training run.
pub const MODEL_ARTIFACT: &str = "model.bin";

/// Hyperparameters of the forecasting network and its optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden units of every recurrent layer.
    pub hidden_size: usize,
    /// Number of stacked recurrent layers.
    pub num_layers: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
}

impl ModelConfig {
    /// Checks that the network can be built and trained with these values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` for zero sizes or a learning rate that
    /// is not a positive finite number.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.hidden_size == 0 {
            return Err(TrainingError::InvalidHyperparameter("hidden_size must be positive"));
        }
        if self.num_layers == 0 {
            return Err(TrainingError::InvalidHyperparameter("num_layers must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainingError::InvalidHyperparameter(
                "learning_rate must be positive and finite",
            ));
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 64,
            num_layers: 2,
            learning_rate: 1e-3,
        }
    }
}

/// Errors raised while training or evaluating.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("no training data provided")]
    EmptyTrainingData,

    #[error("no evaluation data provided")]
    EmptyEvaluationData,

    #[error("input has {actual} features per step, model expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(&'static str),

    #[error("loss became non-finite at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize },

    #[error("evaluation produced non-finite metrics (mse {mse}, mae {mae})")]
    NonFiniteMetrics { mse: f64, mae: f64 },

    #[error("could not read tensor data: {0}")]
    TensorData(String),

    #[error("model serialization failed: {0}")]
    Recorder(#[from] RecorderError),
}

/// Recurrent forecaster.
///
/// Input `[batch, window, features]`, output `[batch, 1]`.
#[derive(Module, Debug)]
pub struct ForecastModel<B: Backend> {
    recurrent: Vec<Lstm<B>>,
    output: Linear<B>,
}

impl<B: Backend> ForecastModel<B> {
    /// Creates a new model for `input_dim` features per step.
    ///
    /// `config` is expected to pass [`ModelConfig::validate`].
    pub fn new(device: &B::Device, input_dim: usize, config: &ModelConfig) -> Self {
        let recurrent = (0..config.num_layers)
            .map(|layer| {
                let d_input = if layer == 0 {
                    input_dim
                } else {
                    config.hidden_size
                };
                LstmConfig::new(d_input, config.hidden_size, true).init(device)
            })
            .collect();
        let output = LinearConfig::new(config.hidden_size, 1).init(device);

        Self { recurrent, output }
    }

    /// Forward pass through the network.
    ///
    /// # Arguments
    ///
    /// * `input` - Tensor of shape [`batch_size`, `window`, `features`]
    ///
    /// # Returns
    ///
    /// Tensor of shape [`batch_size`, 1] predicted from the last time step.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let mut x = input;
        for layer in &self.recurrent {
            let (hidden, _state) = layer.forward(x, None);
            x = hidden;
        }

        let [batch, steps, hidden] = x.dims();
        let last = x
            .slice([0..batch, steps - 1..steps, 0..hidden])
            .reshape([batch, hidden]);

        self.output.forward(last)
    }
}

/// Serializes model weights.
///
/// # Errors
///
/// Returns an error if the recorder fails.
pub fn save_checkpoint<B: Backend>(model: &ForecastModel<B>) -> Result<Vec<u8>, RecorderError> {
    BinBytesRecorder::<FullPrecisionSettings>::default().record(model.clone().into_record(), ())
}

/// Rebuilds a model from weights written by [`save_checkpoint`].
///
/// `input_dim` and `config` must match the architecture that was saved.
///
/// # Errors
///
/// Returns an error if the bytes do not decode into this architecture.
pub fn load_checkpoint<B: Backend>(
    bytes: Vec<u8>,
    input_dim: usize,
    config: &ModelConfig,
    device: &B::Device,
) -> Result<ForecastModel<B>, RecorderError> {
    let record = BinBytesRecorder::<FullPrecisionSettings>::default().load(bytes, device)?;
    Ok(ForecastModel::new(device, input_dim, config).load_record(record))
}

/// Reads a rank-2 `[n, 1]` output into a flat vector.
///
/// # Errors
///
/// Returns an error if the tensor element type is not `f32`.
pub fn output_to_vec<B: Backend>(output: Tensor<B, 2>) -> Result<Vec<f32>, TrainingError> {
    output
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| TrainingError::TensorData(format!("{e:?}")))
}
