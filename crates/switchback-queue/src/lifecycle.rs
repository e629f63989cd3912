//! Job status and result tracking.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use switchback_core::{BuildResult, Error, Job, JobId, JobSnapshot, JobStatus, Result, WorkerId};
use tracing::{debug, info};

use crate::BuildQueue;
use crate::keys::{
    FIELD_COMPLETED_AT, FIELD_DATA, FIELD_RESULT, FIELD_STARTED_AT, FIELD_STATUS,
    FIELD_WORKER_ID,
};

impl BuildQueue {
    /// Move a job to `status`, recording the worker if one is given.
    ///
    /// Only the status fields are written; the job description is never
    /// touched. Rewriting the current status is accepted, going backwards is
    /// not.
    pub async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        worker: Option<&WorkerId>,
    ) -> Result<()> {
        let from: Vec<JobStatus> = JobStatus::ALL
            .into_iter()
            .filter(|current| current.can_transition_to(status))
            .collect();
        self.transition(id, &from, status, worker).await?;
        Ok(())
    }

    /// Store the final result of a job.
    ///
    /// This is independent of [`update_status`](Self::update_status): readers
    /// may see a result while the status still says `building`.
    pub async fn set_result(&self, id: JobId, result: &BuildResult) -> Result<()> {
        let data = serde_json::to_string(result)?;
        let written = self
            .store
            .hash_set_if(&self.keys.job(&id), FIELD_STATUS, None, &[(FIELD_RESULT, data)])
            .await?;
        if written.is_none() {
            return Err(Error::NotFound(format!("job {id}")));
        }

        debug!(job_id = %id, success = result.success, "Stored build result");
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobSnapshot> {
        let fields = self.store.hash_get_all(&self.keys.job(&id)).await?;
        decode_snapshot(id, &fields)
    }

    /// The result of a job, if one has been stored.
    pub async fn get_result(&self, id: JobId) -> Result<Option<BuildResult>> {
        let data = self
            .store
            .hash_get(&self.keys.job(&id), FIELD_RESULT)
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Cancel a job that is still queued or building.
    ///
    /// A queued job stays in its queue structure; the claim that eventually
    /// pops it sees the terminal status and discards it.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let previous = self
            .transition(
                id,
                &[JobStatus::Queued, JobStatus::Building],
                JobStatus::Cancelled,
                None,
            )
            .await?;
        info!(job_id = %id, previous = %previous, "Job cancelled");
        Ok(())
    }

    /// Atomically move a job to `to` if its status is one of `from`.
    ///
    /// Returns the status the job held before. A missing record is
    /// [`Error::NotFound`] and is never recreated; any other status is
    /// [`Error::InvalidTransition`] and nothing is written.
    pub(crate) async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        worker: Option<&WorkerId>,
    ) -> Result<JobStatus> {
        let expected: Vec<&str> = from.iter().map(JobStatus::as_str).collect();
        let fields = status_fields(to, worker);

        let previous: JobStatus = self
            .store
            .hash_set_if(&self.keys.job(&id), FIELD_STATUS, Some(expected.as_slice()), &fields)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .parse()?;

        if !from.contains(&previous) {
            return Err(Error::InvalidTransition { from: previous, to });
        }
        Ok(previous)
    }
}

fn status_fields(status: JobStatus, worker: Option<&WorkerId>) -> Vec<(&'static str, String)> {
    let now = Utc::now().to_rfc3339();
    let mut fields = vec![(FIELD_STATUS, status.as_str().to_string())];

    if let Some(worker) = worker {
        fields.push((FIELD_WORKER_ID, worker.to_string()));
    }
    if status == JobStatus::Building {
        fields.push((FIELD_STARTED_AT, now.clone()));
    }
    if status.is_terminal() {
        fields.push((FIELD_COMPLETED_AT, now));
    }
    fields
}

/// Rebuild a snapshot from the fields of a job record.
pub(crate) fn decode_snapshot(id: JobId, fields: &HashMap<String, String>) -> Result<JobSnapshot> {
    let data = fields
        .get(FIELD_DATA)
        .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
    let job: Job = serde_json::from_str(data)?;

    let status = fields
        .get(FIELD_STATUS)
        .ok_or_else(|| Error::Serialization(format!("job {id} has no status")))?
        .parse()?;

    Ok(JobSnapshot {
        job,
        status,
        worker_id: fields
            .get(FIELD_WORKER_ID)
            .filter(|w| !w.is_empty())
            .map(|w| WorkerId::new(w.as_str())),
        started_at: parse_time(fields.get(FIELD_STARTED_AT))?,
        completed_at: parse_time(fields.get(FIELD_COMPLETED_AT))?,
    })
}

fn parse_time(value: Option<&String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Serialization(format!("bad timestamp {v:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_request, memory_queue};
    use std::time::Duration;

    fn make_result(id: JobId, success: bool) -> BuildResult {
        BuildResult {
            job_id: id,
            success,
            image_uri: "ghcr.io/acme/api:abc1234".to_string(),
            image_digest: "sha256:0f1e2d".to_string(),
            duration_secs: 42.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_status_update_records_worker_and_times() {
        let (queue, _store) = memory_queue();
        let worker = WorkerId::new("w1");
        let id = queue.enqueue(make_request(0)).await.unwrap();

        queue
            .update_status(id, JobStatus::Building, Some(&worker))
            .await
            .unwrap();
        let building = queue.get_job(id).await.unwrap();
        assert_eq!(building.status, JobStatus::Building);
        assert_eq!(building.worker_id, Some(worker.clone()));
        assert!(building.started_at.is_some());
        assert!(building.completed_at.is_none());

        queue
            .update_status(id, JobStatus::Completed, Some(&worker))
            .await
            .unwrap();
        let done = queue.get_job(id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_status_update_leaves_job_body_alone() {
        let (queue, _store) = memory_queue();
        let id = queue.enqueue(make_request(4)).await.unwrap();
        let before = queue.get_job(id).await.unwrap().job;

        queue
            .update_status(id, JobStatus::Building, Some(&WorkerId::new("w1")))
            .await
            .unwrap();

        assert_eq!(queue.get_job(id).await.unwrap().job, before);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let (queue, _store) = memory_queue();
        let id = queue.enqueue(make_request(0)).await.unwrap();
        queue
            .update_status(id, JobStatus::Completed, None)
            .await
            .unwrap();

        let err = queue
            .update_status(id, JobStatus::Building, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Building
            }
        ));
        assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (queue, _store) = memory_queue();
        let id = JobId::new();

        assert!(queue.get_job(id).await.unwrap_err().is_not_found());
        assert!(
            queue
                .update_status(id, JobStatus::Building, None)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            queue
                .set_result(id, &make_result(id, true))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(queue.get_result(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_result_may_precede_terminal_status() {
        let (queue, _store) = memory_queue();
        let id = queue.enqueue(make_request(0)).await.unwrap();
        queue
            .update_status(id, JobStatus::Building, None)
            .await
            .unwrap();

        queue.set_result(id, &make_result(id, true)).await.unwrap();

        assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Building);
        let result = queue.get_result(id).await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.image_digest, "sha256:0f1e2d");
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_expires_after_retention() {
        let (queue, _store) = memory_queue();
        let id = queue.enqueue(make_request(0)).await.unwrap();
        let retention = queue.config().job_retention;

        tokio::time::advance(retention - Duration::from_secs(1)).await;
        assert!(queue.get_job(id).await.is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(queue.get_job(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_to_expired_job_never_recreate_it() {
        let (queue, store) = memory_queue();
        let id = queue.enqueue(make_request(0)).await.unwrap();
        tokio::time::advance(queue.config().job_retention + Duration::from_secs(1)).await;

        assert!(
            queue
                .set_result(id, &make_result(id, true))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            queue
                .update_status(id, JobStatus::Failed, None)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(queue.cancel(id).await.unwrap_err().is_not_found());
        assert!(!store.contains_key(&queue.keys.job(&id)));
    }

    #[tokio::test]
    async fn test_cancelled_build_keeps_its_status() {
        let (queue, _store) = memory_queue();
        let worker = WorkerId::new("w1");
        let id = queue.enqueue(make_request(0)).await.unwrap();
        queue
            .update_status(id, JobStatus::Building, Some(&worker))
            .await
            .unwrap();
        queue.cancel(id).await.unwrap();

        let err = queue
            .update_status(id, JobStatus::Completed, Some(&worker))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobStatus::Cancelled,
                to: JobStatus::Completed
            }
        ));
        assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (queue, _store) = memory_queue();
        let id = queue.enqueue(make_request(0)).await.unwrap();

        queue.cancel(id).await.unwrap();

        let snapshot = queue.get_job(id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_rejected() {
        let (queue, _store) = memory_queue();
        let id = queue.enqueue(make_request(0)).await.unwrap();
        queue
            .update_status(id, JobStatus::Failed, None)
            .await
            .unwrap();

        assert!(matches!(
            queue.cancel(id).await,
            Err(Error::InvalidTransition { .. })
        ));
    }
}
