use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use tracing::debug;

/// Default directory backing the job store, prediction cache and tracker.
const DEFAULT_STORE_ROOT: &str = "./mlops_store";

/// Token table used when `MLOPS_API_TOKENS` is not set.
const DEFAULT_API_TOKENS: &str = "admin:dev-token";

/// Opens the object store rooted at `root`, creating the directory if needed.
///
/// `LocalFileSystem` writes through a temporary file and a rename, so readers
/// never observe a partially written object.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or opened.
pub fn open_object_store(root: &std::path::Path) -> Result<Arc<dyn ObjectStore>> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create store directory {}", root.display()))?;

    let store = LocalFileSystem::new_with_prefix(root)
        .with_context(|| format!("Failed to open object store at {}", root.display()))?;

    Ok(Arc::new(store))
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the shared key-value store.
    pub store_root: PathBuf,

    /// Optional CSV file with raw time-series data. Synthetic data is used when absent.
    pub data_path: Option<PathBuf>,

    /// API tokens keyed by token, valued by caller identity.
    pub api_tokens: BTreeMap<String, String>,

    /// Upper bound for a single store read or write.
    pub store_timeout: Duration,

    /// Lifetime of cached predictions.
    pub prediction_ttl: Duration,

    /// Predictions allowed per identity per minute.
    pub predict_rate_per_minute: u32,

    /// Number of consecutive rows per input sequence.
    pub window_size: usize,

    /// Experiment name used for tracked training runs.
    pub experiment_name: String,

    /// Tracked run whose model serves predictions. The baseline predictor is used when unset.
    pub model_run_id: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `MLOPS_STORE_ROOT`: store directory (default: `./mlops_store`)
    /// - `MLOPS_DATA_PATH`: CSV with `timestamp,consumption` columns
    /// - `MLOPS_API_TOKENS`: comma separated `identity:token` pairs (default: `admin:dev-token`)
    /// - `MLOPS_STORE_TIMEOUT_MS`: store operation timeout (default: 2000)
    /// - `MLOPS_PREDICTION_TTL_SECONDS`: prediction cache TTL (default: 3600)
    /// - `MLOPS_PREDICT_RATE_PER_MINUTE`: predictions per identity per minute (default: 5)
    /// - `MLOPS_WINDOW_SIZE`: sequence window (default: 24)
    /// - `MLOPS_EXPERIMENT_NAME`: experiment for training runs (default: `Base_LSTM`)
    /// - `MLOPS_MODEL_RUN_ID`: run whose model serves predictions
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let store_root = lookup("MLOPS_STORE_ROOT")
            .map_or_else(|| PathBuf::from(DEFAULT_STORE_ROOT), PathBuf::from);

        let data_path = lookup("MLOPS_DATA_PATH")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let api_tokens =
            parse_tokens(&lookup("MLOPS_API_TOKENS").unwrap_or_else(|| DEFAULT_API_TOKENS.into()))?;

        let store_timeout =
            Duration::from_millis(parse_or("MLOPS_STORE_TIMEOUT_MS", &lookup, 2000)?);
        let prediction_ttl =
            Duration::from_secs(parse_or("MLOPS_PREDICTION_TTL_SECONDS", &lookup, 3600)?);
        let predict_rate_per_minute = parse_or("MLOPS_PREDICT_RATE_PER_MINUTE", &lookup, 5)?;
        let window_size = parse_or("MLOPS_WINDOW_SIZE", &lookup, 24)?;

        if predict_rate_per_minute == 0 {
            bail!("MLOPS_PREDICT_RATE_PER_MINUTE must be positive");
        }
        if window_size == 0 {
            bail!("MLOPS_WINDOW_SIZE must be positive");
        }

        let experiment_name =
            lookup("MLOPS_EXPERIMENT_NAME").unwrap_or_else(|| String::from("Base_LSTM"));
        let model_run_id = lookup("MLOPS_MODEL_RUN_ID").filter(|id| !id.trim().is_empty());

        debug!(store_root = %store_root.display(), window_size, "Configuration loaded");

        Ok(Self {
            store_root,
            data_path,
            api_tokens,
            store_timeout,
            prediction_ttl,
            predict_rate_per_minute,
            window_size,
            experiment_name,
            model_run_id,
        })
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

/// Parses `identity:token` pairs into a token → identity map.
fn parse_tokens(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut tokens = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((identity, token)) = pair.split_once(':') else {
            bail!("MLOPS_API_TOKENS entry `{pair}` is not of the form identity:token");
        };
        if identity.is_empty() || token.is_empty() {
            bail!("MLOPS_API_TOKENS entry `{pair}` has an empty identity or token");
        }
        tokens.insert(token.to_string(), identity.to_string());
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).expect("defaults should load");

        assert_eq!(config.store_root, PathBuf::from(DEFAULT_STORE_ROOT));
        assert!(config.data_path.is_none());
        assert_eq!(config.api_tokens.get("dev-token").map(String::as_str), Some("admin"));
        assert_eq!(config.store_timeout, Duration::from_secs(2));
        assert_eq!(config.prediction_ttl, Duration::from_secs(3600));
        assert_eq!(config.predict_rate_per_minute, 5);
        assert_eq!(config.window_size, 24);
        assert_eq!(config.experiment_name, "Base_LSTM");
        assert!(config.model_run_id.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("MLOPS_STORE_ROOT", "/tmp/store"),
            ("MLOPS_DATA_PATH", "data/energy.csv"),
            ("MLOPS_API_TOKENS", "alice:a1, bob:b2"),
            ("MLOPS_WINDOW_SIZE", "12"),
            ("MLOPS_MODEL_RUN_ID", "abc"),
        ]))
        .expect("overrides should load");

        assert_eq!(config.store_root, PathBuf::from("/tmp/store"));
        assert_eq!(config.data_path, Some(PathBuf::from("data/energy.csv")));
        assert_eq!(config.api_tokens.len(), 2);
        assert_eq!(config.api_tokens.get("b2").map(String::as_str), Some("bob"));
        assert_eq!(config.window_size, 12);
        assert_eq!(config.model_run_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("MLOPS_WINDOW_SIZE", "abc")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("MLOPS_WINDOW_SIZE", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("MLOPS_API_TOKENS", "no-colon")])).is_err());
    }

    #[test]
    fn test_open_object_store_creates_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("nested").join("store");

        open_object_store(&root).expect("store should open");
        assert!(root.is_dir());
    }
}
