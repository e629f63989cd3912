//! CLI command implementations.

pub mod jobs;
pub mod logs;
pub mod ops;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use switchback_config::{SystemConfig, load_config};
use switchback_queue::BuildQueue;
use switchback_store::RedisTarget;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "switchback.kdl";

/// Load the system configuration, falling back to defaults when no file is
/// given and none exists in the working directory.
pub fn load_system_config(path: Option<&Path>, redis_url: Option<String>) -> Result<SystemConfig> {
    let mut config = match path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_config(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load config file: {}", DEFAULT_CONFIG_PATH))?,
        None => SystemConfig::default(),
    };

    // An explicit URL always means a standalone server.
    if let Some(url) = redis_url {
        config.redis.url = url;
        config.redis.sentinel = None;
    }
    Ok(config)
}

fn redis_target(config: &SystemConfig) -> RedisTarget {
    match &config.redis.sentinel {
        Some(sentinel) => RedisTarget::Sentinel {
            master_name: sentinel.master_name.clone(),
            addrs: sentinel.addrs.clone(),
            password: sentinel.password.clone(),
        },
        None => RedisTarget::Standalone(config.redis.url.clone()),
    }
}

pub async fn connect(config: &SystemConfig) -> Result<Arc<BuildQueue>> {
    let store = switchback_store::connect(&redis_target(config))
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(BuildQueue::new(
        Arc::new(store),
        config.queue.clone(),
    )))
}

pub fn validate_config(path: &Path) -> Result<()> {
    let config = load_config(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;

    println!("Configuration is valid");
    match &config.redis.sentinel {
        Some(sentinel) => println!(
            "  redis:       sentinel master {} via {}",
            sentinel.master_name,
            sentinel.addrs.join(", ")
        ),
        None => println!("  redis:       {}", config.redis.url),
    }
    println!("  key prefix:  {}", config.queue.key_prefix);
    println!("  max builds:  {}", config.worker.max_concurrent_builds);
    println!("  max retries: {}", config.callbacks.max_attempts);
    Ok(())
}

/// A token cancelled on Ctrl-C.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
        cancel.cancel();
    });
    token
}
