//! Time-ordered store of failed completion callbacks.
//!
//! Each pending redelivery is a record plus an entry in an index scored by its
//! due time. Drivers pop due entries atomically, so two drivers polling at the
//! same moment never deliver the same attempt twice.

use chrono::{DateTime, Utc};
use switchback_core::{AttemptId, CallbackAttempt, Error, JobId, Result};
use tracing::{debug, error, info, warn};

use crate::BuildQueue;
use crate::keys::{FIELD_CREATED_AT, FIELD_DATA};

impl BuildQueue {
    /// Record a failed delivery for `job_id`, due again at `next_retry_at`.
    pub async fn schedule_retry(
        &self,
        job_id: JobId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<AttemptId> {
        let attempt = CallbackAttempt::new(job_id, next_retry_at);
        let key = self.keys.callback(&attempt.id);

        self.store
            .hash_set(
                &key,
                &[
                    (FIELD_DATA, serde_json::to_string(&attempt)?),
                    (FIELD_CREATED_AT, attempt.created_at.to_rfc3339()),
                ],
            )
            .await?;

        let indexed = match self
            .store
            .expire(&key, self.config.callback_retention)
            .await
        {
            Ok(()) => {
                self.store
                    .sorted_add(
                        &self.keys.callback_index(),
                        &attempt.id.to_string(),
                        attempt.due_score(),
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = indexed {
            if let Err(cleanup) = self.store.delete(&key).await {
                warn!(attempt_id = %attempt.id, error = %cleanup, "Failed to remove unindexed callback record");
            }
            return Err(err);
        }

        info!(
            attempt_id = %attempt.id,
            job_id = %job_id,
            next_retry_at = %next_retry_at,
            "Callback retry scheduled"
        );
        Ok(attempt.id)
    }

    /// Take up to `limit` attempts that are due now.
    ///
    /// Taken attempts leave the index; hand each one back with
    /// [`reschedule`](Self::reschedule) or drop it with
    /// [`abandon`](Self::abandon). An entry whose record cannot be read right
    /// now is put back; if that happens before anything was taken the error
    /// is returned, otherwise the attempts taken so far are.
    pub async fn claim_ready(&self, limit: usize) -> Result<Vec<CallbackAttempt>> {
        let now = Utc::now().timestamp_millis() as f64;
        let index = self.keys.callback_index();
        let mut ready = Vec::new();

        for _ in 0..limit {
            let popped = match self.store.atomic_pop_min(&index, Some(now)).await {
                Ok(popped) => popped,
                Err(err) if ready.is_empty() => return Err(err),
                Err(err) => {
                    warn!(error = %err, claimed = ready.len(), "Stopping callback claim early");
                    break;
                }
            };
            let Some((member, score)) = popped else {
                break;
            };

            let id: AttemptId = match member.parse() {
                Ok(id) => id,
                Err(err) => {
                    warn!(member = %member, error = %err, "Dropping malformed callback index entry");
                    continue;
                }
            };

            let key = self.keys.callback(&id);
            let data = match self.store.hash_get(&key, FIELD_DATA).await {
                Ok(data) => data,
                Err(err) => {
                    if let Err(restore) = self.store.sorted_add(&index, &member, score).await {
                        error!(attempt_id = %id, error = %restore, "Failed to return callback attempt to the index");
                    }
                    if ready.is_empty() {
                        return Err(err);
                    }
                    warn!(attempt_id = %id, error = %err, claimed = ready.len(), "Stopping callback claim early");
                    break;
                }
            };

            let Some(data) = data else {
                warn!(attempt_id = %id, "Callback attempt expired before delivery");
                continue;
            };
            match serde_json::from_str::<CallbackAttempt>(&data) {
                Ok(attempt) => ready.push(attempt),
                Err(err) => {
                    error!(attempt_id = %id, error = %err, "Dropping undecodable callback attempt");
                    if let Err(cleanup) = self.store.delete(&key).await {
                        warn!(attempt_id = %id, error = %cleanup, "Failed to remove undecodable callback attempt");
                    }
                }
            }
        }

        if !ready.is_empty() {
            debug!(count = ready.len(), "Claimed due callback attempts");
        }
        Ok(ready)
    }

    /// Put a claimed attempt back in the index unchanged.
    pub(crate) async fn release(&self, attempt: &CallbackAttempt) -> Result<()> {
        self.store
            .sorted_add(
                &self.keys.callback_index(),
                &attempt.id.to_string(),
                attempt.due_score(),
            )
            .await
    }

    /// Put a claimed attempt back, due at `next_retry_at`, counting one more
    /// failed delivery.
    pub async fn reschedule(
        &self,
        attempt: &mut CallbackAttempt,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        if next_retry_at <= attempt.next_retry_at {
            return Err(Error::Validation(format!(
                "retry time {next_retry_at} is not after {}",
                attempt.next_retry_at
            )));
        }

        let updated = CallbackAttempt {
            attempts: attempt.attempts + 1,
            next_retry_at,
            ..attempt.clone()
        };
        let written = self
            .store
            .hash_set_if(
                &self.keys.callback(&attempt.id),
                FIELD_CREATED_AT,
                None,
                &[(FIELD_DATA, serde_json::to_string(&updated)?)],
            )
            .await?;
        if written.is_none() {
            return Err(Error::NotFound(format!("callback attempt {}", attempt.id)));
        }
        self.release(&updated).await?;

        debug!(
            attempt_id = %updated.id,
            attempts = updated.attempts,
            next_retry_at = %next_retry_at,
            "Callback retry rescheduled"
        );
        *attempt = updated;
        Ok(())
    }

    /// Forget an attempt. Unknown attempts are ignored.
    pub async fn abandon(&self, id: AttemptId) -> Result<()> {
        self.store.delete(&self.keys.callback(&id)).await?;
        self.store
            .sorted_remove(&self.keys.callback_index(), &id.to_string())
            .await?;
        Ok(())
    }

    /// Attempts waiting in the index, due or not.
    ///
    /// An entry whose record has expired is still counted until a claim
    /// reaches it and drops it.
    pub async fn pending_count(&self) -> Result<u64> {
        self.store.sorted_len(&self.keys.callback_index()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RacingStore, memory_queue};
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use switchback_config::QueueConfig;
    use switchback_core::CoordinationStore;

    #[tokio::test]
    async fn test_only_due_attempts_are_claimed() {
        let (queue, _store) = memory_queue();
        let job = JobId::new();

        let due = queue
            .schedule_retry(job, Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();
        queue
            .schedule_retry(job, Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();

        let ready = queue.claim_ready(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due);
        assert_eq!(ready[0].job_id, job);
        assert_eq!(ready[0].attempts, 1);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_limit() {
        let (queue, _store) = memory_queue();
        for _ in 0..5 {
            queue
                .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
                .await
                .unwrap();
        }

        assert_eq!(queue.claim_ready(3).await.unwrap().len(), 3);
        assert_eq!(queue.claim_ready(3).await.unwrap().len(), 2);
        assert!(queue.claim_ready(3).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_drivers_never_share_attempts() {
        let (queue, _store) = memory_queue();
        let mut scheduled = HashSet::new();
        for _ in 0..50 {
            let id = queue
                .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
                .await
                .unwrap();
            scheduled.insert(id);
        }

        let drivers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut mine = Vec::new();
                    loop {
                        let batch = queue.claim_ready(4).await.unwrap();
                        if batch.is_empty() {
                            break mine;
                        }
                        mine.extend(batch.into_iter().map(|a| a.id));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for driver in drivers {
            for id in driver.await.unwrap() {
                assert!(seen.insert(id), "attempt {id} claimed twice");
            }
        }
        assert_eq!(seen, scheduled);
    }

    #[tokio::test]
    async fn test_reschedule_moves_forward_only() {
        let (queue, _store) = memory_queue();
        queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();
        let mut attempt = queue.claim_ready(1).await.unwrap().remove(0);
        let original = attempt.next_retry_at;

        let err = queue.reschedule(&mut attempt, original).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(attempt.attempts, 1);

        let later = Utc::now() + ChronoDuration::minutes(5);
        queue.reschedule(&mut attempt, later).await.unwrap();
        assert_eq!(attempt.attempts, 2);
        assert_eq!(attempt.next_retry_at, later);

        assert!(queue.claim_ready(10).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rescheduled_attempt_becomes_due_again() {
        let (queue, _store) = memory_queue();
        queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(10))
            .await
            .unwrap();
        let mut attempt = queue.claim_ready(1).await.unwrap().remove(0);

        queue
            .reschedule(&mut attempt, Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        let again = queue.claim_ready(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_abandon_is_idempotent() {
        let (queue, _store) = memory_queue();
        let id = queue
            .schedule_retry(JobId::new(), Utc::now() + ChronoDuration::minutes(1))
            .await
            .unwrap();

        queue.abandon(id).await.unwrap();
        queue.abandon(id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_attempt_is_dropped() {
        let (queue, _store) = memory_queue();
        let id = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        tokio::time::advance(queue.config().callback_retention + Duration::from_secs(1)).await;

        assert!(queue.claim_ready(10).await.unwrap().is_empty());
        let mut stale = CallbackAttempt::new(JobId::new(), Utc::now());
        stale.id = id;
        let err = queue
            .reschedule(&mut stale, Utc::now() + ChronoDuration::minutes(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_long_overdue_attempt_stays_pending() {
        let (queue, _store) = memory_queue();
        let overdue = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::hours(25))
            .await
            .unwrap();
        queue
            .schedule_retry(JobId::new(), Utc::now() + ChronoDuration::minutes(1))
            .await
            .unwrap();

        assert_eq!(queue.pending_count().await.unwrap(), 2);

        let ready = queue.claim_ready(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, overdue);
    }

    #[tokio::test]
    async fn test_undecodable_attempt_does_not_sink_the_batch() {
        let (queue, store) = memory_queue();
        let good = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(2))
            .await
            .unwrap();
        let broken = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();
        store
            .hash_set(&queue.keys.callback(&broken), &[(FIELD_DATA, "{oops".to_string())])
            .await
            .unwrap();

        let ready = queue.claim_ready(10).await.unwrap();

        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, good);
        assert!(!store.contains_key(&queue.keys.callback(&broken)));
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_attempt_returns_to_the_index() {
        let store = Arc::new(RacingStore::new());
        let queue = BuildQueue::new(store.clone(), QueueConfig::default());
        let first = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(2))
            .await
            .unwrap();
        let second = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        store.fail_next_read(&queue.keys.callback(&second));
        let ready = queue.claim_ready(10).await.unwrap();
        assert_eq!(ready.iter().map(|a| a.id).collect::<Vec<_>>(), vec![first]);
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        let again = queue.claim_ready(10).await.unwrap();
        assert_eq!(again.iter().map(|a| a.id).collect::<Vec<_>>(), vec![second]);
    }

    #[tokio::test]
    async fn test_failed_first_read_is_reported_and_kept() {
        let store = Arc::new(RacingStore::new());
        let queue = BuildQueue::new(store.clone(), QueueConfig::default());
        let id = queue
            .schedule_retry(JobId::new(), Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        store.fail_next_read(&queue.keys.callback(&id));
        let err = queue.claim_ready(10).await.unwrap_err();

        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert_eq!(queue.claim_ready(10).await.unwrap()[0].id, id);
    }
}
