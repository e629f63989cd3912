//! Worker that claims jobs from the queue and builds them.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use switchback_config::WorkerSettings;
use switchback_core::{
    BuildResult, BuildRunner, CallbackSender, Error, Job, JobStatus, Result, WorkerId,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::logs::JobLogSink;
use crate::{BuildQueue, RetryPolicy};

/// Pause after a failed claim before trying again.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A worker that claims and executes build jobs.
#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    queue: Arc<BuildQueue>,
    runner: Arc<dyn BuildRunner>,
    callbacks: Arc<dyn CallbackSender>,
    policy: RetryPolicy,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<BuildQueue>,
        runner: Arc<dyn BuildRunner>,
        callbacks: Arc<dyn CallbackSender>,
        policy: RetryPolicy,
        settings: WorkerSettings,
    ) -> Self {
        let id = match &settings.id {
            Some(id) => WorkerId::new(id.as_str()),
            None => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
                WorkerId::generate(&host)
            }
        };

        Self {
            id,
            queue,
            runner,
            callbacks,
            policy,
            settings,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Run the worker loop until `shutdown` fires.
    ///
    /// At most `max_concurrent_builds` jobs run at once. On shutdown the
    /// worker stops claiming, gives in-flight builds the grace period to
    /// finish, aborts whatever is left and unregisters.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.id,
            runner = self.runner.name(),
            max_concurrent_builds = self.settings.max_concurrent_builds,
            "Starting worker"
        );
        self.queue.register(&self.id).await?;

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_builds.max(1)));
        let mut builds = JoinSet::new();

        loop {
            while let Some(finished) = builds.try_join_next() {
                if let Err(e) = finished {
                    error!(worker_id = %self.id, error = %e, "Build task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            // A claim runs to completion once started; it waits at most one
            // poll interval.
            match self.queue.claim(&self.id, self.settings.poll_interval).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    builds.spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(Error::ClaimedMissing(job_id)) => {
                    warn!(worker_id = %self.id, job_id = %job_id, "Skipping claimed job without a record");
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(CLAIM_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if !builds.is_empty() {
            info!(worker_id = %self.id, in_flight = builds.len(), "Waiting for in-flight builds");
        }
        let drained = timeout(self.settings.shutdown_grace, async {
            while builds.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(worker_id = %self.id, aborted = builds.len(), "Shutdown grace elapsed, aborting builds");
            builds.shutdown().await;
        }

        self.queue.unregister(&self.id).await?;
        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    /// Build one claimed job and report its outcome.
    async fn process(&self, job: Job) {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            service_id = %job.service_id,
            git_sha = %job.short_sha(),
            "Building job"
        );

        let started = Instant::now();
        let sink = JobLogSink::new(self.queue.clone(), job.id);
        let outcome = timeout(self.settings.build_timeout, self.runner.run(&job, &sink)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(job_id = %job.id, error = %e, "Build runner failed");
                BuildResult::failure(&job, e.to_string(), elapsed)
            }
            Err(_) => {
                warn!(job_id = %job.id, timeout = ?self.settings.build_timeout, "Build timed out");
                BuildResult::failure(
                    &job,
                    format!("build timed out after {:?}", self.settings.build_timeout),
                    elapsed,
                )
            }
        };

        if let Err(e) = self.queue.set_result(job.id, &result).await {
            error!(job_id = %job.id, error = %e, "Failed to store build result");
        }

        let status = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        match self.queue.update_status(job.id, status, Some(&self.id)).await {
            Ok(()) => info!(
                job_id = %job.id,
                status = %status,
                duration_secs = result.duration_secs,
                "Job finished"
            ),
            Err(Error::InvalidTransition { from, .. }) => {
                warn!(job_id = %job.id, current = %from, "Job changed status while building");
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to update job status"),
        }

        if let Some(url) = &job.callback_url {
            self.notify(&job, url, &result).await;
        }
    }

    /// Send the completion callback, leaving failures to the retry subsystem.
    async fn notify(&self, job: &Job, url: &Url, result: &BuildResult) {
        let err = match self.callbacks.send(url, result).await {
            Ok(()) => {
                debug!(job_id = %job.id, "Callback delivered");
                return;
            }
            Err(err) => err,
        };

        let delay = ChronoDuration::from_std(self.policy.delay(1))
            .unwrap_or(ChronoDuration::seconds(30));
        match self.queue.schedule_retry(job.id, Utc::now() + delay).await {
            Ok(attempt_id) => warn!(
                job_id = %job.id,
                attempt_id = %attempt_id,
                error = %err,
                "Callback failed, scheduled for retry"
            ),
            Err(e) => error!(
                job_id = %job.id,
                error = %e,
                callback_error = %err,
                "Callback failed and could not be scheduled for retry"
            ),
        }
    }
}
