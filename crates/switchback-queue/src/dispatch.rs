//! Handing queued jobs to workers.

use std::time::Duration;
use switchback_core::{Error, Job, JobId, JobStatus, Result, WorkerId};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::BuildQueue;
use crate::lifecycle::decode_snapshot;

impl BuildQueue {
    /// Claim the next job for `worker`, waiting up to `max_wait` for one.
    ///
    /// Expedited jobs always go first; the FIFO structure is only consulted
    /// when no expedited job is queued. Every id is removed from its queue by
    /// a single atomic pop, so no two claimers ever receive the same job.
    ///
    /// The move to `building` only happens while the job is still `queued`,
    /// so ids whose job was cancelled while queued are dropped and the claim
    /// moves on. An id whose record has vanished is consumed and reported as
    /// [`Error::ClaimedMissing`]; it is not put back.
    ///
    /// Once an id has been popped the claim should be allowed to finish:
    /// dropping the future between the pop and the status write loses the job.
    pub async fn claim(&self, worker: &WorkerId, max_wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + max_wait;

        loop {
            let Some(raw) = self.pop_next(deadline).await? else {
                return Ok(None);
            };

            let id: JobId = match raw.parse() {
                Ok(id) => id,
                Err(err) => {
                    error!(raw = %raw, error = %err, "Dropping malformed job id from queue");
                    continue;
                }
            };

            let fields = self.store.hash_get_all(&self.keys.job(&id)).await?;
            if fields.is_empty() {
                warn!(job_id = %id, worker_id = %worker, "Claimed job has no record");
                return Err(Error::ClaimedMissing(id));
            }

            let snapshot = decode_snapshot(id, &fields)?;
            if snapshot.status != JobStatus::Queued {
                debug!(job_id = %id, status = %snapshot.status, "Skipping job that is no longer queued");
                continue;
            }

            // A cancel may land between the read above and this write.
            match self
                .transition(id, &[JobStatus::Queued], JobStatus::Building, Some(worker))
                .await
            {
                Ok(_) => {}
                Err(Error::InvalidTransition { from, .. }) => {
                    debug!(job_id = %id, status = %from, "Job left the queued status before it was claimed");
                    continue;
                }
                Err(err) if err.is_not_found() => {
                    warn!(job_id = %id, worker_id = %worker, "Claimed job has no record");
                    return Err(Error::ClaimedMissing(id));
                }
                Err(err) => return Err(err),
            }

            info!(
                job_id = %id,
                worker_id = %worker,
                priority = snapshot.job.priority,
                git_sha = %snapshot.job.short_sha(),
                "Claimed job"
            );
            return Ok(Some(snapshot.job));
        }
    }

    /// Pop one id, expedited structure first, blocking on the FIFO structure
    /// until `deadline`.
    async fn pop_next(&self, deadline: Instant) -> Result<Option<String>> {
        if let Some((member, _)) = self
            .store
            .atomic_pop_min(&self.keys.priority_queue(), None)
            .await?
        {
            return Ok(Some(member));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.store
            .list_blocking_pop(&self.keys.fifo_queue(), remaining)
            .await
    }
}
