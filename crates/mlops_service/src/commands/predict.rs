//! Predict command - forecasts the sequences in a JSON request file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::print_json;
use crate::api::{ApiService, PredictRequest};

/// Runs the predict command.
///
/// `input` holds a request body: `{"features": [[[...], ...], ...]}`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the request is
/// rejected.
pub async fn run(service: &ApiService, token: &str, input: &Path) -> Result<()> {
    let json = std::fs::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let request: PredictRequest = serde_json::from_slice(&json)
        .with_context(|| format!("Failed to parse prediction request {}", input.display()))?;

    info!(sequences = request.features.len(), "Requesting prediction");

    let response = service.predict(token, request).await?;
    print_json(&response)
}
