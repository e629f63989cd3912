//! Operator views and the callback redelivery driver.

use anyhow::{Context, Result};
use std::sync::Arc;
use switchback_config::SystemConfig;
use switchback_queue::{BuildQueue, CallbackRetrier, HttpCallbackSender};

use super::interrupt_token;

pub async fn workers(queue: &BuildQueue) -> Result<()> {
    let workers = queue.active_workers().await?;
    if workers.is_empty() {
        println!("No active workers");
    }
    for worker in workers {
        println!("{}", worker);
    }
    Ok(())
}

pub async fn stats(queue: &BuildQueue) -> Result<()> {
    let stats = queue.stats().await?;
    println!("Queued jobs:       {}", stats.queue_depth());
    println!("  expedited:       {}", stats.priority_depth);
    println!("  fifo:            {}", stats.fifo_depth);
    println!("Pending callbacks: {}", stats.pending_callbacks);
    println!("Active workers:    {}", stats.active_workers);
    Ok(())
}

/// Run the callback retrier until Ctrl-C.
pub async fn deliver_callbacks(queue: Arc<BuildQueue>, config: &SystemConfig) -> Result<()> {
    let sender = HttpCallbackSender::from_settings(&config.callbacks)
        .context("Failed to build callback HTTP client")?;
    let retrier = CallbackRetrier::new(queue, Arc::new(sender), &config.callbacks);

    retrier.run(interrupt_token()).await?;
    Ok(())
}
