//! Pending redeliveries of completion callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AttemptId, JobId};

/// One pending retry of a job's completion notification.
///
/// `attempts` counts the deliveries that have failed so far, so a freshly
/// scheduled attempt starts at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAttempt {
    pub id: AttemptId,
    pub job_id: JobId,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CallbackAttempt {
    pub fn new(job_id: JobId, next_retry_at: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            job_id,
            attempts: 1,
            next_retry_at,
            created_at: Utc::now(),
        }
    }

    /// Score in the retry index.
    pub fn due_score(&self) -> f64 {
        self.next_retry_at.timestamp_millis() as f64
    }
}
