//! Job admission.

use chrono::Utc;
use switchback_core::job::MAX_PRIORITY;
use switchback_core::{Error, JobId, JobStatus, NewJob, Result};
use tracing::{info, warn};

use crate::BuildQueue;
use crate::keys::{FIELD_CREATED_AT, FIELD_DATA, FIELD_STATUS};

impl BuildQueue {
    /// Admit a job and return the identity it was given.
    ///
    /// The record is written before the queue reference, so a claimed id
    /// always had a record. If placing the reference fails the record is
    /// removed again and the job never becomes claimable.
    pub async fn enqueue(&self, request: NewJob) -> Result<JobId> {
        request.validate()?;

        let job = request.admit(JobId::new(), Utc::now());
        let data = serde_json::to_string(&job)?;
        let key = self.keys.job(&job.id);

        self.store
            .hash_set(
                &key,
                &[
                    (FIELD_DATA, data),
                    (FIELD_STATUS, JobStatus::Queued.as_str().to_string()),
                    (FIELD_CREATED_AT, job.created_at.to_rfc3339()),
                ],
            )
            .await?;

        let placed = match self.store.expire(&key, self.config.job_retention).await {
            Ok(()) if job.priority > 0 => {
                self.store
                    .sorted_add(
                        &self.keys.priority_queue(),
                        &job.id.to_string(),
                        job.priority_score(),
                    )
                    .await
            }
            Ok(()) => {
                self.store
                    .list_push(&self.keys.fifo_queue(), &job.id.to_string())
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = placed {
            warn!(job_id = %job.id, error = %err, "Failed to queue job, removing its record");
            if let Err(cleanup) = self.store.delete(&key).await {
                warn!(job_id = %job.id, error = %cleanup, "Failed to remove unqueued job record");
            }
            return Err(err);
        }

        info!(
            job_id = %job.id,
            service_id = %job.service_id,
            git_sha = %job.short_sha(),
            priority = job.priority,
            "Job enqueued"
        );

        Ok(job.id)
    }

    /// Admit a failed or cancelled job again as a new job, one priority step
    /// higher than before.
    pub async fn retry(&self, id: JobId) -> Result<JobId> {
        let snapshot = self.get_job(id).await?;
        if !matches!(snapshot.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(Error::InvalidTransition {
                from: snapshot.status,
                to: JobStatus::Queued,
            });
        }

        let mut request = snapshot.job.to_request();
        request.priority = (request.priority + 1).min(MAX_PRIORITY);

        let new_id = self.enqueue(request).await?;
        info!(job_id = %id, new_job_id = %new_id, "Job re-admitted");
        Ok(new_id)
    }
}
