//! CLI command implementations.

pub mod predict;
pub mod status;
pub mod train;

use anyhow::Result;
use serde::Serialize;

/// Prints a response as pretty JSON on stdout.
fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
