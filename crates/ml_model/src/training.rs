//! Training and evaluation of the forecast model.

use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use features::SequenceSet;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{SequenceBatcher, SequenceDataset};
use crate::tracking::TrackingRun;
use crate::{ForecastModel, MODEL_ARTIFACT, ModelConfig, TrainingError, output_to_vec, save_checkpoint};

/// Batch size used for inference during evaluation.
const EVAL_BATCH_SIZE: usize = 256;

/// Output from training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutput {
    /// Tracking run the params, losses and weights were logged under.
    pub run_id: String,
    /// Average loss of the last epoch.
    pub final_loss: f32,
}

/// Population error metrics over a held-out set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub mse: f64,
    pub mae: f64,
}

/// Owns a model instance and fits it with mini-batch gradient descent.
#[derive(Debug)]
pub struct Trainer<B: AutodiffBackend> {
    model: ForecastModel<B>,
    config: ModelConfig,
    input_dim: usize,
    device: B::Device,
    seed: u64,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Creates a trainer with a freshly initialized model.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` if `config` or `input_dim` cannot
    /// describe a trainable network.
    pub fn new(
        device: B::Device,
        input_dim: usize,
        config: ModelConfig,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        if input_dim == 0 {
            return Err(TrainingError::InvalidHyperparameter("input_dim must be positive"));
        }

        let model = ForecastModel::new(&device, input_dim, &config);
        Ok(Self {
            model,
            config,
            input_dim,
            device,
            seed: 0,
        })
    }

    /// Sets the base seed for per-epoch shuffling.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The trained model.
    pub const fn model(&self) -> &ForecastModel<B> {
        &self.model
    }

    /// Hyperparameters the trainer was built with.
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Trains on `data` for `epochs` passes of shuffled mini-batches.
    ///
    /// Params, the per-epoch `train_loss` and the final weights
    /// ([`MODEL_ARTIFACT`]) are logged to `run`. Any failing batch aborts the
    /// whole call; nothing is logged as an artifact in that case.
    ///
    /// # Errors
    ///
    /// Fails before any gradient step on empty data, shape mismatches or
    /// zero epochs/batch size, and during training on a non-finite loss.
    pub fn train(
        &mut self,
        data: &SequenceSet,
        epochs: usize,
        batch_size: usize,
        run: &mut TrackingRun,
    ) -> Result<TrainingOutput, TrainingError> {
        if data.is_empty() {
            return Err(TrainingError::EmptyTrainingData);
        }
        if data.feature_count != self.input_dim {
            return Err(TrainingError::ShapeMismatch {
                expected: self.input_dim,
                actual: data.feature_count,
            });
        }
        if epochs == 0 {
            return Err(TrainingError::InvalidHyperparameter("epochs must be positive"));
        }
        if batch_size == 0 {
            return Err(TrainingError::InvalidHyperparameter("batch_size must be positive"));
        }

        run.log_param("input_dim", self.input_dim);
        run.log_param("hidden_size", self.config.hidden_size);
        run.log_param("num_layers", self.config.num_layers);
        run.log_param("learning_rate", self.config.learning_rate);
        run.log_param("epochs", epochs);
        run.log_param("batch_size", batch_size);
        run.log_param("window_size", data.window_size);

        info!(
            run_id = run.run_id(),
            epochs,
            batch_size,
            samples = data.len(),
            "Starting training"
        );

        let dataset = SequenceDataset::new(data);
        let batcher = SequenceBatcher::<B>::new(self.device.clone(), data.window_size, data.feature_count);

        let mut optimizer = AdamConfig::new().init();
        let loss_fn = MseLoss::new();
        let mut final_loss = 0.0;

        for epoch in 0..epochs {
            let mut epoch_loss = 0.0;
            let mut batch_count: u32 = 0;

            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);

            for (batch_index, batch_indices) in indices.chunks(batch_size).enumerate() {
                let items: Vec<_> = batch_indices
                    .iter()
                    .filter_map(|&i| dataset.get(i))
                    .collect();

                if items.is_empty() {
                    continue;
                }

                let batch = batcher.batch(items);

                // Forward pass
                let predictions = self.model.forward(batch.inputs);
                let loss = loss_fn.forward(predictions, batch.targets, Reduction::Mean);

                let loss_value: f32 = loss
                    .clone()
                    .into_data()
                    .to_vec()
                    .unwrap_or_else(|_| vec![f32::NAN])
                    .first()
                    .copied()
                    .unwrap_or(f32::NAN);

                if !loss_value.is_finite() {
                    return Err(TrainingError::NonFiniteLoss {
                        epoch,
                        batch: batch_index,
                    });
                }

                epoch_loss += f64::from(loss_value);
                batch_count += 1;

                // Backward pass
                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &self.model);

                // Update weights
                self.model = optimizer.step(self.config.learning_rate, self.model.clone(), grads);
            }

            final_loss = if batch_count > 0 {
                (epoch_loss / f64::from(batch_count)) as f32
            } else {
                0.0
            };

            run.log_metric("train_loss", f64::from(final_loss), epoch);
            info!(epoch = epoch + 1, epochs, loss = final_loss, "Epoch finished");
        }

        run.log_artifact(MODEL_ARTIFACT, save_checkpoint(&self.model)?);

        Ok(TrainingOutput {
            run_id: run.run_id().to_string(),
            final_loss,
        })
    }

    /// Runs inference over `data` without updating weights.
    ///
    /// # Errors
    ///
    /// Fails on empty data, a feature-count mismatch, or metrics that are
    /// not finite (a NaN target or a diverged model).
    pub fn evaluate(&self, data: &SequenceSet) -> Result<EvaluationMetrics, TrainingError> {
        if data.is_empty() {
            return Err(TrainingError::EmptyEvaluationData);
        }
        if data.feature_count != self.input_dim {
            return Err(TrainingError::ShapeMismatch {
                expected: self.input_dim,
                actual: data.feature_count,
            });
        }

        let model = self.model.valid();
        let batcher = SequenceBatcher::<B::InnerBackend>::new(
            self.device.clone(),
            data.window_size,
            data.feature_count,
        );
        let stride = data.window_size * data.feature_count;

        let mut predictions = Vec::with_capacity(data.len());
        for chunk in data.windows.chunks(EVAL_BATCH_SIZE * stride) {
            let output = model.forward(batcher.inputs(chunk));
            predictions.extend(output_to_vec(output)?);
        }

        let metrics = regression_metrics(&predictions, &data.targets);
        if !(metrics.mse.is_finite() && metrics.mae.is_finite()) {
            return Err(TrainingError::NonFiniteMetrics {
                mse: metrics.mse,
                mae: metrics.mae,
            });
        }

        debug!(mse = metrics.mse, mae = metrics.mae, "Evaluated model");
        Ok(metrics)
    }
}

/// Population MSE and MAE between paired predictions and targets.
#[must_use]
pub fn regression_metrics(predictions: &[f32], targets: &[f32]) -> EvaluationMetrics {
    let n = predictions.len().min(targets.len());
    if n == 0 {
        return EvaluationMetrics { mse: 0.0, mae: 0.0 };
    }

    let (squared, absolute) = predictions
        .iter()
        .zip(targets)
        .fold((0.0_f64, 0.0_f64), |(sq, abs), (&p, &t)| {
            let err = f64::from(p) - f64::from(t);
            (err.mul_add(err, sq), abs + err.abs())
        });

    EvaluationMetrics {
        mse: squared / n as f64,
        mae: absolute / n as f64,
    }
}
