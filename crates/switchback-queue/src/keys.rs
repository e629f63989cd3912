//! Key layout in the coordination store.

use switchback_core::{AttemptId, JobId};

/// Fields of a job record.
pub const FIELD_DATA: &str = "data";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_WORKER_ID: &str = "worker_id";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_STARTED_AT: &str = "started_at";
pub const FIELD_COMPLETED_AT: &str = "completed_at";
pub const FIELD_RESULT: &str = "result";

/// Fields of a log stream entry.
pub const FIELD_LINE: &str = "line";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Builds every key the queue touches from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash holding a job's description, status and result.
    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    /// Ordered set of expedited job ids.
    pub fn priority_queue(&self) -> String {
        format!("{}:queue:priority", self.prefix)
    }

    /// List of normal job ids, oldest at the head.
    pub fn fifo_queue(&self) -> String {
        format!("{}:queue:builds", self.prefix)
    }

    pub fn logs(&self, id: &JobId) -> String {
        format!("{}:logs:{}", self.prefix, id)
    }

    pub fn callback(&self, id: &AttemptId) -> String {
        format!("{}:callback:{}", self.prefix, id)
    }

    /// Ordered set of attempt ids scored by next retry time.
    pub fn callback_index(&self) -> String {
        format!("{}:queue:callback_retry", self.prefix)
    }

    pub fn active_workers(&self) -> String {
        format!("{}:workers:active", self.prefix)
    }
}
