//! Traits for the work a build worker performs.
//!
//! Building, signing and scanning an image is opaque to the queue; a worker
//! only needs something that turns a [`Job`] into a [`BuildResult`] and
//! something that tells the downstream orchestrator about it.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::{BuildResult, Job, Result};

/// Destination for the log output of a running build.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn line(&self, line: &str);
}

/// Trait for build runners.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Execute the build, writing progress to `logs`.
    ///
    /// A build that ran and failed is an `Ok` result with `success = false`;
    /// `Err` is reserved for the runner itself breaking.
    async fn run(&self, job: &Job, logs: &dyn LogSink) -> Result<BuildResult>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("callback request failed: {0}")]
    Request(String),

    #[error("callback returned status {0}")]
    Status(u16),
}

/// Trait for delivering completion notifications.
#[async_trait]
pub trait CallbackSender: Send + Sync {
    async fn send(&self, url: &Url, result: &BuildResult) -> std::result::Result<(), DeliveryError>;
}
