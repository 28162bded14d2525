//! Status command - prints a job record.

use anyhow::Result;

use super::print_json;
use crate::api::ApiService;

/// Runs the status command.
///
/// # Errors
///
/// Returns an error if the job is unknown or the store cannot be read.
pub async fn run(service: &ApiService, token: &str, job_id: &str) -> Result<()> {
    let record = service.job_status(token, job_id).await?;
    print_json(&record)
}
