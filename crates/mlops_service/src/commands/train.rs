//! Train command - submits a training job and hosts it until it finishes.

use anyhow::Result;
use tracing::info;

use super::print_json;
use crate::api::{ApiService, TrainRequest, TrainResponse};

/// Runs the train command.
///
/// The job runs inside this process, so the command always stays alive until
/// the terminal state is written. Other processes sharing the store can poll
/// it with `status` meanwhile. With `wait`, the terminal record is printed too.
///
/// # Errors
///
/// Returns an error if the job cannot be submitted or its task aborts.
pub async fn run(service: &ApiService, token: &str, epochs: usize, wait: bool) -> Result<()> {
    let handle = service.start_training(token, TrainRequest { epochs }).await?;

    print_json(&TrainResponse {
        job_id: handle.job_id().to_string(),
        status: String::from("submitted"),
    })?;

    let record = handle.wait().await?;
    info!(job_id = %record.job_id, status = %record.status, "Training job finished");

    if wait {
        print_json(&record)?;
    }

    Ok(())
}
