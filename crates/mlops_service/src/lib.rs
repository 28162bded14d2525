//! Forecast training and serving service.
//!
//! Training requests become background jobs whose lifecycle is persisted in
//! a shared store; predictions are served by the latest configured model (or
//! a baseline) and cached by input fingerprint.

use std::sync::Arc;

use anyhow::{Context, Result};
use config::Config;
use ml_model::ExperimentTracker;
use object_store::ObjectStore;
use store::{JobStore, PredictionCache};
use tracing::info;

pub mod api;
pub mod commands;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod predictor;

pub use api::{ApiError, ApiService, ApiSettings, StaticTokenAuthenticator};
pub use orchestrator::{JobHandle, JobOrchestrator};
pub use pipeline::{PipelineConfig, TrainingPipeline};
pub use predictor::{BaselinePredictor, ModelPredictor, Predictor};

/// Wires the service from configuration and an opened store.
///
/// # Errors
///
/// Returns an error if a configured model run cannot be loaded.
pub async fn build_service(config: &Config, store: Arc<dyn ObjectStore>) -> Result<ApiService> {
    let tracker = ExperimentTracker::new(Arc::clone(&store));

    let predictor: Arc<dyn Predictor> = match &config.model_run_id {
        Some(run_id) => Arc::new(
            ModelPredictor::load(&tracker, &config.experiment_name, run_id)
                .await
                .with_context(|| format!("Failed to load model run {run_id}"))?,
        ),
        None => {
            info!("No model run configured, serving baseline predictions");
            Arc::new(BaselinePredictor)
        }
    };

    let orchestrator = JobOrchestrator::new(
        JobStore::new(Arc::clone(&store), config.store_timeout),
        TrainingPipeline::new(PipelineConfig::from_config(config), tracker),
    );

    ApiService::new(
        Arc::new(StaticTokenAuthenticator::new(config.api_tokens.clone())),
        orchestrator,
        PredictionCache::new(store, config.store_timeout),
        predictor,
        ApiSettings {
            prediction_ttl: config.prediction_ttl,
            predict_rate_per_minute: config.predict_rate_per_minute,
        },
    )
    .context("Failed to register request metrics")
}
