//! Request handlers: authentication, validation, rate limiting.
//!
//! Handlers are transport-agnostic. Each takes the caller's bearer token and
//! a typed request and returns a typed response or an [`ApiError`] carrying
//! the status code a transport should answer with.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use store::{JobRecord, PredictionCache, PredictionResult, StoreError};
use tracing::{debug, error, warn};

use crate::metrics::ApiMetrics;
use crate::orchestrator::{JobHandle, JobOrchestrator, OrchestratorError};
use crate::predictor::{PredictError, Predictor};

/// Epochs used when a training request does not specify any.
pub const DEFAULT_EPOCHS: usize = 10;

type KeyedRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Resolves bearer tokens to caller identities.
pub trait Authenticator: Send + Sync {
    /// Returns the identity owning `token`, if any.
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// Fixed token table, keyed by token.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: BTreeMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// Creates an authenticator from a `token -> identity` map.
    #[must_use]
    pub const fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Errors surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid or missing credentials")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status a transport should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized => 401,
            Self::NotFound(_) => 404,
            Self::RateLimited => 429,
            Self::Internal(_) => 500,
        }
    }

    /// Message safe to show to the caller. Internal details are withheld.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => String::from("internal server error"),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::InvalidEpochs => Self::Validation(e.to_string()),
            OrchestratorError::NotFound(_) => Self::NotFound(e.to_string()),
            OrchestratorError::Store(_) | OrchestratorError::Task(_) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        match e {
            PredictError::ShapeMismatch { .. }
            | PredictError::OutOfRange(_)
            | PredictError::NonFinitePrediction(_) => Self::Validation(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainRequest {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
}

impl Default for TrainRequest {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
        }
    }
}

const fn default_epochs() -> usize {
    DEFAULT_EPOCHS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainResponse {
    pub job_id: String,
    pub status: String,
}

/// Batch of sequences, `[sequence][step][feature]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub features: Vec<Vec<Vec<f64>>>,
}

/// One forecast per input sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: Vec<f64>,
}

/// Tunables of the request path.
#[derive(Debug, Clone, Copy)]
pub struct ApiSettings {
    pub prediction_ttl: Duration,
    pub predict_rate_per_minute: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            prediction_ttl: Duration::from_secs(3600),
            predict_rate_per_minute: 5,
        }
    }
}

/// The service's handlers with their injected dependencies.
pub struct ApiService {
    auth: Arc<dyn Authenticator>,
    orchestrator: JobOrchestrator,
    cache: PredictionCache,
    predictor: Arc<dyn Predictor>,
    predict_limiter: KeyedRateLimiter,
    prediction_ttl: Duration,
    metrics: ApiMetrics,
}

impl ApiService {
    /// Wires the handlers and registers their request metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the metric collectors cannot be registered.
    pub fn new(
        auth: Arc<dyn Authenticator>,
        orchestrator: JobOrchestrator,
        cache: PredictionCache,
        predictor: Arc<dyn Predictor>,
        settings: ApiSettings,
    ) -> prometheus::Result<Self> {
        let rate = NonZeroU32::new(settings.predict_rate_per_minute).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            auth,
            orchestrator,
            cache,
            predictor,
            predict_limiter: RateLimiter::keyed(Quota::per_minute(rate)),
            prediction_ttl: settings.prediction_ttl,
            metrics: ApiMetrics::new()?,
        })
    }

    /// Liveness check. Needs no credentials.
    #[must_use]
    pub fn health(&self) -> HealthResponse {
        let started = Instant::now();
        let response = HealthResponse {
            status: String::from("ok"),
        };
        self.metrics.observe("health", started, &Ok::<_, ApiError>(()));
        response
    }

    /// Request counters and latencies in the Prometheus text format. Needs
    /// no credentials.
    ///
    /// # Errors
    ///
    /// `Internal` if the metrics cannot be encoded.
    pub fn metrics(&self) -> Result<String, ApiError> {
        self.metrics
            .render()
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Collectors behind [`ApiService::metrics`].
    #[must_use]
    pub const fn request_metrics(&self) -> &ApiMetrics {
        &self.metrics
    }

    /// Starts a training job and returns without waiting for it.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `Validation` for zero epochs, or `Internal` if the
    /// job cannot be recorded.
    pub async fn submit_training(
        &self,
        token: &str,
        request: TrainRequest,
    ) -> Result<TrainResponse, ApiError> {
        let handle = self.start_training(token, request).await?;

        Ok(TrainResponse {
            job_id: handle.detach(),
            status: String::from("submitted"),
        })
    }

    /// Like [`ApiService::submit_training`] but hands back the job handle, for
    /// callers hosting the job in their own process.
    ///
    /// # Errors
    ///
    /// Same as [`ApiService::submit_training`].
    pub async fn start_training(
        &self,
        token: &str,
        request: TrainRequest,
    ) -> Result<JobHandle, ApiError> {
        let started = Instant::now();
        let outcome = self.start_training_inner(token, request).await;
        self.metrics.observe("train", started, &outcome);
        outcome
    }

    async fn start_training_inner(
        &self,
        token: &str,
        request: TrainRequest,
    ) -> Result<JobHandle, ApiError> {
        let identity = self.authenticate(token)?;
        if request.epochs == 0 {
            return Err(ApiError::Validation(String::from("epochs must be positive")));
        }

        debug!(identity = %identity, epochs = request.epochs, "Training requested");
        Ok(self.orchestrator.submit(request.epochs).await?)
    }

    /// Current record of a job.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `NotFound` for an unknown job, or `Internal`.
    pub async fn job_status(&self, token: &str, job_id: &str) -> Result<JobRecord, ApiError> {
        let started = Instant::now();
        let outcome = match self.authenticate(token) {
            Ok(_) => self.orchestrator.status(job_id).await.map_err(ApiError::from),
            Err(e) => Err(e),
        };
        self.metrics.observe("status", started, &outcome);
        outcome
    }

    /// Forecasts one value per sequence, serving repeated inputs from the cache.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `RateLimited`, `Validation` for malformed input or a
    /// non-finite forecast, or `Internal`. Failed predictions are never
    /// cached.
    pub async fn predict(
        &self,
        token: &str,
        request: PredictRequest,
    ) -> Result<PredictResponse, ApiError> {
        let started = Instant::now();
        let outcome = self.predict_inner(token, request).await;
        self.metrics.observe("predict", started, &outcome);
        outcome
    }

    async fn predict_inner(
        &self,
        token: &str,
        request: PredictRequest,
    ) -> Result<PredictResponse, ApiError> {
        let identity = self.authenticate(token)?;
        if self.predict_limiter.check_key(&identity).is_err() {
            warn!(identity = %identity, "Prediction rate limit exceeded");
            return Err(ApiError::RateLimited);
        }

        validate_features(&request.features)?;

        let features = request.features;
        let result = self
            .cache
            .get_or_compute(&features, self.prediction_ttl, || {
                let predictor = Arc::clone(&self.predictor);
                let batch = features.clone();
                async move {
                    let prediction = tokio::task::spawn_blocking(move || predictor.predict(&batch))
                        .await
                        .map_err(|e| ApiError::Internal(e.to_string()))??;
                    if let Some(i) = prediction.iter().position(|v| !v.is_finite()) {
                        return Err(ApiError::from(PredictError::NonFinitePrediction(i)));
                    }
                    Ok::<_, ApiError>(PredictionResult { prediction })
                }
            })
            .await
            .inspect_err(|e| {
                if matches!(e, ApiError::Internal(_)) {
                    error!(error = %e, "Prediction failed");
                }
            })?;

        Ok(PredictResponse {
            prediction: result.prediction,
        })
    }

    fn authenticate(&self, token: &str) -> Result<String, ApiError> {
        self.auth.authenticate(token).ok_or(ApiError::Unauthorized)
    }
}

/// Checks that `features` is a non-empty, rectangular batch of finite values.
///
/// # Errors
///
/// Returns `Validation` describing the first problem found.
pub fn validate_features(features: &[Vec<Vec<f64>>]) -> Result<(), ApiError> {
    let invalid = |msg: String| Err(ApiError::Validation(msg));

    let Some(first) = features.first() else {
        return invalid(String::from("features must contain at least one sequence"));
    };
    let steps = first.len();
    if steps == 0 {
        return invalid(String::from("sequences must not be empty"));
    }
    let width = first[0].len();
    if width == 0 {
        return invalid(String::from("feature vectors must not be empty"));
    }

    for (i, sequence) in features.iter().enumerate() {
        if sequence.len() != steps {
            return invalid(format!(
                "sequence {i} has {} steps, expected {steps}",
                sequence.len()
            ));
        }
        for (j, step) in sequence.iter().enumerate() {
            if step.len() != width {
                return invalid(format!(
                    "sequence {i} step {j} has {} features, expected {width}",
                    step.len()
                ));
            }
            if step.iter().any(|v| !v.is_finite()) {
                return invalid(format!("sequence {i} step {j} contains a non-finite value"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ml_model::ExperimentTracker;
    use object_store::ObjectStore;
    use object_store::memory::InMemory;
    use store::{JobStatus, JobStore};

    use super::*;
    use crate::pipeline::tests::small_config;
    use crate::pipeline::{PipelineConfig, TrainingPipeline};
    use crate::predictor::BaselinePredictor;

    const TOKEN: &str = "dev-token";

    /// Counts calls and delegates to the baseline.
    #[derive(Default)]
    struct CountingPredictor {
        calls: AtomicUsize,
    }

    impl Predictor for CountingPredictor {
        fn predict(&self, features: &[Vec<Vec<f64>>]) -> Result<Vec<f64>, PredictError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            BaselinePredictor.predict(features)
        }
    }

    fn service_with(
        config: PipelineConfig,
        predictor: Arc<dyn Predictor>,
        settings: ApiSettings,
    ) -> ApiService {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let timeout = Duration::from_secs(2);
        let orchestrator = JobOrchestrator::new(
            JobStore::new(Arc::clone(&store), timeout),
            TrainingPipeline::new(config, ExperimentTracker::new(Arc::clone(&store))),
        );
        let auth = StaticTokenAuthenticator::new(BTreeMap::from([(
            TOKEN.to_string(),
            String::from("admin"),
        )]));

        ApiService::new(
            Arc::new(auth),
            orchestrator,
            PredictionCache::new(store, timeout),
            predictor,
            settings,
        )
        .expect("service")
    }

    /// Returns the same value for every sequence, however large the input.
    struct ConstantPredictor {
        value: f64,
        calls: AtomicUsize,
    }

    impl Predictor for ConstantPredictor {
        fn predict(&self, features: &[Vec<Vec<f64>>]) -> Result<Vec<f64>, PredictError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![self.value; features.len()])
        }
    }

    fn service() -> ApiService {
        service_with(
            small_config(),
            Arc::new(BaselinePredictor),
            ApiSettings::default(),
        )
    }

    fn ramp_request() -> PredictRequest {
        PredictRequest {
            features: vec![(0..24).map(|i| vec![f64::from(i); 3]).collect()],
        }
    }

    async fn wait_for_terminal(service: &ApiService, job_id: &str) -> JobRecord {
        for _ in 0..600 {
            let record = service.job_status(TOKEN, job_id).await.expect("status");
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[test]
    fn test_health() {
        assert_eq!(service().health().status, "ok");
    }

    #[test]
    fn test_train_request_defaults_epochs() {
        let request: TrainRequest = serde_json::from_str("{}").expect("parse");
        assert_eq!(request.epochs, DEFAULT_EPOCHS);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Validation(String::new()).status_code(), 400);
        assert_eq!(ApiError::Unauthorized.status_code(), 401);
        assert_eq!(ApiError::NotFound(String::new()).status_code(), 404);
        assert_eq!(ApiError::RateLimited.status_code(), 429);

        let internal = ApiError::Internal(String::from("disk on fire"));
        assert_eq!(internal.status_code(), 500);
        assert!(!internal.client_message().contains("disk"));
    }

    #[tokio::test]
    async fn test_training_job_completes() {
        let service = service();

        let response = service
            .submit_training(TOKEN, TrainRequest { epochs: 2 })
            .await
            .expect("submit");
        assert_eq!(response.status, "submitted");

        let record = wait_for_terminal(&service, &response.job_id).await;
        assert_eq!(record.status, JobStatus::Completed);
        let metrics = record.metrics.expect("metrics");
        assert!(metrics.mse >= 0.0);
        assert!(metrics.mae >= 0.0);
    }

    #[tokio::test]
    async fn test_repeated_prediction_is_cached() {
        let predictor = Arc::new(CountingPredictor::default());
        let service = service_with(small_config(), predictor.clone(), ApiSettings::default());

        let first = service.predict(TOKEN, ramp_request()).await.expect("first");
        let second = service.predict(TOKEN, ramp_request()).await.expect("second");

        assert_eq!(first.prediction.len(), 1);
        assert_eq!(first, second);
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extreme_finite_inputs_are_served_and_cached() {
        let predictor = Arc::new(CountingPredictor::default());
        let service = service_with(small_config(), predictor.clone(), ApiSettings::default());
        let request = PredictRequest {
            features: vec![vec![vec![1e308, 1e308]]],
        };

        let first = service.predict(TOKEN, request.clone()).await.expect("first");
        assert!(first.prediction.iter().all(|v| v.is_finite()));
        for _ in 0..2 {
            let again = service.predict(TOKEN, request.clone()).await.expect("again");
            assert_eq!(again, first);
        }
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_finite_forecast_is_rejected_and_not_cached() {
        let predictor = Arc::new(ConstantPredictor {
            value: f64::INFINITY,
            calls: AtomicUsize::new(0),
        });
        let service = service_with(small_config(), predictor.clone(), ApiSettings::default());

        for _ in 0..2 {
            let result = service.predict(TOKEN, ramp_request()).await;
            assert!(matches!(&result, Err(ApiError::Validation(_))));
            assert_eq!(result.err().map(|e| e.status_code()), Some(400));
        }
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handlers_are_counted_in_metrics() {
        let service = service();

        service.health();
        service.predict(TOKEN, ramp_request()).await.expect("predict");
        let _ = service.predict("wrong", ramp_request()).await;
        let _ = service.job_status(TOKEN, "job_404").await;
        service
            .submit_training(TOKEN, TrainRequest { epochs: 0 })
            .await
            .expect_err("zero epochs");

        let metrics = service.request_metrics();
        assert_eq!(metrics.request_count("health", 200), 1);
        assert_eq!(metrics.request_count("predict", 200), 1);
        assert_eq!(metrics.request_count("predict", 401), 1);
        assert_eq!(metrics.request_count("status", 404), 1);
        assert_eq!(metrics.request_count("train", 400), 1);

        let text = service.metrics().expect("metrics");
        assert!(text.contains("api_requests_total"));
        assert!(text.contains(r#"handler="status""#));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let result = service().job_status(TOKEN, "job_123").await;
        assert!(matches!(&result, Err(ApiError::NotFound(_))));
        assert_eq!(result.err().map(|e| e.status_code()), Some(404));
    }

    #[tokio::test]
    async fn test_empty_training_split_fails_job() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "timestamp,consumption").expect("write");
        for hour in 0..5 {
            writeln!(file, "2024-01-01 {hour:02}:00:00,{}", 40 + hour).expect("write");
        }

        // Five rows with a window of four leave a single sequence, which
        // the 80/20 split assigns to the test side.
        let config = PipelineConfig {
            data_path: Some(file.path().to_path_buf()),
            window_size: 4,
            ..small_config()
        };
        let service = service_with(config, Arc::new(BaselinePredictor), ApiSettings::default());

        let response = service
            .submit_training(TOKEN, TrainRequest { epochs: 1 })
            .await
            .expect("submit");
        let record = wait_for_terminal(&service, &response.job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("no training data provided"));
        assert!(record.metrics.is_none());
    }

    #[tokio::test]
    async fn test_nan_reading_fails_job_with_readable_record() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "timestamp,consumption").expect("write");
        for hour in 0..24 {
            let reading = if hour == 7 {
                String::from("NaN")
            } else {
                (40 + hour).to_string()
            };
            writeln!(file, "2024-01-01 {hour:02}:00:00,{reading}").expect("write");
        }

        let config = PipelineConfig {
            data_path: Some(file.path().to_path_buf()),
            window_size: 4,
            ..small_config()
        };
        let service = service_with(config, Arc::new(BaselinePredictor), ApiSettings::default());

        let response = service
            .submit_training(TOKEN, TrainRequest { epochs: 1 })
            .await
            .expect("submit");
        let record = wait_for_terminal(&service, &response.job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.metrics.is_none());
        assert!(record.error.expect("error").contains("non-finite value"));
    }

    #[tokio::test]
    async fn test_requests_need_a_valid_token() {
        let service = service();

        assert!(matches!(
            service.submit_training("wrong", TrainRequest::default()).await,
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            service.job_status("", "job_1").await,
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            service.predict("wrong", ramp_request()).await,
            Err(ApiError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_zero_epochs_rejected() {
        let result = service()
            .submit_training(TOKEN, TrainRequest { epochs: 0 })
            .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sixth_prediction_within_a_minute_is_limited() {
        let service = service();

        for i in 0..5 {
            service
                .predict(TOKEN, ramp_request())
                .await
                .unwrap_or_else(|e| panic!("call {i} failed: {e}"));
        }

        assert!(matches!(
            service.predict(TOKEN, ramp_request()).await,
            Err(ApiError::RateLimited)
        ));
    }

    #[test]
    fn test_validation_rejects_malformed_batches() {
        let cases: Vec<Vec<Vec<Vec<f64>>>> = vec![
            vec![],
            vec![vec![]],
            vec![vec![vec![]]],
            vec![vec![vec![1.0, 2.0]], vec![vec![1.0, 2.0], vec![3.0, 4.0]]],
            vec![vec![vec![1.0, 2.0], vec![3.0]]],
            vec![vec![vec![1.0, f64::NAN]]],
            vec![vec![vec![f64::INFINITY]]],
        ];

        for features in cases {
            assert!(
                matches!(validate_features(&features), Err(ApiError::Validation(_))),
                "{features:?}"
            );
        }

        assert!(validate_features(&ramp_request().features).is_ok());
    }
}
