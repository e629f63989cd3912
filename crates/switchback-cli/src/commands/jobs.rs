//! Job admission and inspection commands.

use anyhow::{Context, Result};
use std::path::Path;
use switchback_core::{JobId, NewJob};
use switchback_queue::BuildQueue;

fn parse_id(id: &str) -> Result<JobId> {
    id.parse()
        .with_context(|| format!("Invalid job ID: {}", id))
}

/// Admit the job described in a JSON file.
pub async fn enqueue(queue: &BuildQueue, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read job file: {}", file.display()))?;
    let request: NewJob = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", file.display()))?;

    let id = queue.enqueue(request).await?;
    println!("{}", id);
    Ok(())
}

pub async fn show(queue: &BuildQueue, id: &str) -> Result<()> {
    let snapshot = queue.get_job(parse_id(id)?).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

pub async fn result(queue: &BuildQueue, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    match queue.get_result(id).await? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => anyhow::bail!("Job {} has no result yet", id),
    }
    Ok(())
}

pub async fn cancel(queue: &BuildQueue, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    queue.cancel(id).await?;
    println!("Cancelled {}", id);
    Ok(())
}

pub async fn retry(queue: &BuildQueue, id: &str) -> Result<()> {
    let new_id = queue.retry(parse_id(id)?).await?;
    println!("{}", new_id);
    Ok(())
}
