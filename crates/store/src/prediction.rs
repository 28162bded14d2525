//! Prediction cache keyed by a content fingerprint of the input.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use object_store::ObjectStore;
use object_store::path::Path as ObjectStorePath;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{Result, StoreError, with_timeout};

/// One scalar forecast per input sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction: Vec<f64>,
}

/// Persisted cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result: PredictionResult,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stable content hash of a batch of sequences, as `pred_<sha256 hex>`.
///
/// The shape is hashed before the values, so batches holding the same
/// numbers in a different layout get different keys. `-0.0` hashes like `0.0`.
#[must_use]
pub fn fingerprint(features: &[Vec<Vec<f64>>]) -> String {
    let mut hasher = Sha256::new();

    hasher.update((features.len() as u64).to_le_bytes());
    for sequence in features {
        hasher.update((sequence.len() as u64).to_le_bytes());
        for step in sequence {
            hasher.update((step.len() as u64).to_le_bytes());
            for &value in step {
                let value = if value == 0.0 { 0.0 } else { value };
                hasher.update(value.to_le_bytes());
            }
        }
    }

    format!("pred_{:x}", hasher.finalize())
}

/// Read-through cache of prediction results under `predictions/{fingerprint}.json`.
#[derive(Debug, Clone)]
pub struct PredictionCache {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl PredictionCache {
    /// Creates a cache over `store`, bounding every call by `timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Returns the cached result for `features`, if present and not expired.
    ///
    /// Expired entries are deleted, and so are entries that no longer decode.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the store does not answer in time, or the
    /// underlying store/serialization error.
    pub async fn lookup(&self, features: &[Vec<Vec<f64>>]) -> Result<Option<PredictionResult>> {
        let key = fingerprint(features);

        with_timeout(self.timeout, "cache lookup", async {
            let path = entry_path(&key);
            let bytes = match self.store.get(&path).await {
                Ok(result) => result.bytes().await?,
                Err(object_store::Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(fingerprint = %key, error = %e, "Dropping undecodable prediction");
                    self.remove(&path).await?;
                    return Ok(None);
                }
            };
            if entry.is_expired(Utc::now()) {
                debug!(fingerprint = %key, "Dropping expired prediction");
                self.remove(&path).await?;
                return Ok(None);
            }

            debug!(fingerprint = %key, "Prediction cache hit");
            Ok(Some(entry.result))
        })
        .await
    }

    async fn remove(&self, path: &ObjectStorePath) -> Result<()> {
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Caches `result` for `features` until `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `NonFinitePrediction` if a value cannot round-trip through
    /// JSON, `Timeout` if the store does not answer in time, or the
    /// underlying store/serialization error.
    pub async fn store(
        &self,
        features: &[Vec<Vec<f64>>],
        result: PredictionResult,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        if let Some(&value) = result.prediction.iter().find(|v| !v.is_finite()) {
            return Err(StoreError::NonFinitePrediction(value));
        }

        let now = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let entry = CacheEntry {
            fingerprint: fingerprint(features),
            result,
            expires_at,
        };

        with_timeout(self.timeout, "cache store", async {
            let json = serde_json::to_vec(&entry)?;
            self.store
                .put(&entry_path(&entry.fingerprint), json.into())
                .await?;
            Ok(())
        })
        .await?;

        debug!(fingerprint = %entry.fingerprint, %expires_at, "Cached prediction");
        Ok(entry)
    }

    /// Returns the cached result, or runs `compute` and caches its output.
    ///
    /// A failed write after a successful compute is logged and the computed
    /// result is still returned.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures and errors from `compute`.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        features: &[Vec<Vec<f64>>],
        ttl: Duration,
        compute: F,
    ) -> std::result::Result<PredictionResult, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<PredictionResult, E>>,
        E: From<StoreError>,
    {
        if let Some(hit) = self.lookup(features).await? {
            return Ok(hit);
        }

        let result = compute().await?;
        if let Err(e) = self.store(features, result.clone(), ttl).await {
            warn!(error = %e, "Failed to cache prediction");
        }

        Ok(result)
    }
}

fn entry_path(fingerprint: &str) -> ObjectStorePath {
    ObjectStorePath::from(format!("predictions/{fingerprint}.json"))
}
