//! Redelivery of failed completion callbacks.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use switchback_config::{BackoffKind, BackoffSettings, CallbackSettings};
use switchback_core::{CallbackAttempt, CallbackSender, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BuildQueue;

/// How long to wait before the next delivery of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed(Duration),
    Linear { step: Duration, max: Duration },
    Exponential { base: Duration, max: Duration },
}

impl RetryPolicy {
    pub fn from_settings(settings: &BackoffSettings) -> Self {
        match settings.kind {
            BackoffKind::Fixed => RetryPolicy::Fixed(settings.base),
            BackoffKind::Linear => RetryPolicy::Linear {
                step: settings.base,
                max: settings.max,
            },
            BackoffKind::Exponential => RetryPolicy::Exponential {
                base: settings.base,
                max: settings.max,
            },
        }
    }

    /// Delay after `failures` failed deliveries (the first failure is 1).
    pub fn delay(&self, failures: u32) -> Duration {
        let failures = failures.max(1);
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Linear { step, max } => step.saturating_mul(failures).min(max),
            RetryPolicy::Exponential { base, max } => {
                let factor = 2u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&BackoffSettings::default())
    }
}

/// Counters from one pass over the due attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPassStats {
    pub delivered: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
    /// Attempts handed back untouched after a store error.
    pub released: usize,
}

impl RetryPassStats {
    pub fn total(&self) -> usize {
        self.delivered + self.rescheduled + self.abandoned + self.released
    }
}

enum Outcome {
    Delivered,
    Rescheduled,
    Abandoned,
}

/// Periodically redelivers callbacks whose earlier delivery failed.
pub struct CallbackRetrier {
    queue: Arc<BuildQueue>,
    sender: Arc<dyn CallbackSender>,
    policy: RetryPolicy,
    max_attempts: u32,
    batch_size: usize,
    poll_interval: Duration,
}

impl CallbackRetrier {
    pub fn new(
        queue: Arc<BuildQueue>,
        sender: Arc<dyn CallbackSender>,
        settings: &CallbackSettings,
    ) -> Self {
        Self {
            queue,
            sender,
            policy: RetryPolicy::from_settings(&settings.backoff),
            max_attempts: settings.max_attempts,
            batch_size: settings.batch_size,
            poll_interval: settings.poll_interval,
        }
    }

    /// Run passes every poll interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            max_attempts = self.max_attempts,
            "Starting callback retrier"
        );

        loop {
            match self.run_once().await {
                Ok(stats) if stats.total() > 0 => info!(
                    delivered = stats.delivered,
                    rescheduled = stats.rescheduled,
                    abandoned = stats.abandoned,
                    released = stats.released,
                    "Callback retry pass finished"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Callback retry pass failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!("Callback retrier stopped");
        Ok(())
    }

    /// Deliver every attempt that is due now.
    ///
    /// Only the claim itself can fail the pass. An attempt whose handling
    /// hits a store error goes back into the index as it was, so the next
    /// pass sees it again.
    pub async fn run_once(&self) -> Result<RetryPassStats> {
        let mut stats = RetryPassStats::default();

        for mut attempt in self.queue.claim_ready(self.batch_size).await? {
            match self.redeliver(&mut attempt).await {
                Ok(Outcome::Delivered) => stats.delivered += 1,
                Ok(Outcome::Rescheduled) => stats.rescheduled += 1,
                Ok(Outcome::Abandoned) => stats.abandoned += 1,
                Err(e) => {
                    warn!(attempt_id = %attempt.id, job_id = %attempt.job_id, error = %e, "Callback redelivery interrupted");
                    match self.queue.release(&attempt).await {
                        Ok(()) => stats.released += 1,
                        Err(e) => error!(
                            attempt_id = %attempt.id,
                            error = %e,
                            "Failed to hand callback attempt back"
                        ),
                    }
                }
            }
        }

        Ok(stats)
    }

    async fn redeliver(&self, attempt: &mut CallbackAttempt) -> Result<Outcome> {
        let job_id = attempt.job_id;

        let snapshot = match self.queue.get_job(job_id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                warn!(attempt_id = %attempt.id, job_id = %job_id, "Job gone, abandoning callback");
                self.queue.abandon(attempt.id).await?;
                return Ok(Outcome::Abandoned);
            }
            Err(e) => return Err(e),
        };

        let (Some(url), Some(result)) = (
            snapshot.job.callback_url,
            self.queue.get_result(job_id).await?,
        ) else {
            warn!(attempt_id = %attempt.id, job_id = %job_id, "Nothing to deliver, abandoning callback");
            self.queue.abandon(attempt.id).await?;
            return Ok(Outcome::Abandoned);
        };

        match self.sender.send(&url, &result).await {
            Ok(()) => {
                info!(
                    attempt_id = %attempt.id,
                    job_id = %job_id,
                    attempts = attempt.attempts,
                    "Callback delivered on retry"
                );
                self.queue.abandon(attempt.id).await?;
                Ok(Outcome::Delivered)
            }
            Err(e) if attempt.attempts >= self.max_attempts => {
                warn!(
                    attempt_id = %attempt.id,
                    job_id = %job_id,
                    attempts = attempt.attempts,
                    error = %e,
                    "Giving up on callback"
                );
                self.queue.abandon(attempt.id).await?;
                Ok(Outcome::Abandoned)
            }
            Err(e) => {
                let delay = ChronoDuration::from_std(self.policy.delay(attempt.attempts))
                    .unwrap_or(ChronoDuration::hours(1));
                let next = (Utc::now() + delay)
                    .max(attempt.next_retry_at + ChronoDuration::milliseconds(1));
                self.queue.reschedule(attempt, next).await?;
                debug!(
                    attempt_id = %attempt.id,
                    job_id = %job_id,
                    error = %e,
                    next_retry_at = %next,
                    "Callback redelivery failed"
                );
                Ok(Outcome::Rescheduled)
            }
        }
    }
}
