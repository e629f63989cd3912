//! The build queue handle shared by admission callers, workers and operators.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchback_config::QueueConfig;
use switchback_core::{CoordinationStore, Result};

use crate::keys::Keys;

/// Build dispatch queue backed by a coordination store.
///
/// The handle is cheap to share behind an `Arc`; it holds no queue state of its
/// own. Operations are spread over the `admission`, `dispatch`, `lifecycle`,
/// `logs`, `registry` and `callbacks` modules.
pub struct BuildQueue {
    pub(crate) store: Arc<dyn CoordinationStore>,
    pub(crate) config: QueueConfig,
    pub(crate) keys: Keys,
}

/// Operational counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub priority_depth: u64,
    pub fifo_depth: u64,
    pub pending_callbacks: u64,
    pub active_workers: u64,
}

impl QueueStats {
    pub fn queue_depth(&self) -> u64 {
        self.priority_depth + self.fifo_depth
    }
}

impl BuildQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, config: QueueConfig) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
        Self {
            store,
            config,
            keys,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Jobs waiting to be claimed, priority and FIFO together.
    pub async fn queue_depth(&self) -> Result<u64> {
        let priority = self.store.sorted_len(&self.keys.priority_queue()).await?;
        let fifo = self.store.list_len(&self.keys.fifo_queue()).await?;
        Ok(priority + fifo)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            priority_depth: self.store.sorted_len(&self.keys.priority_queue()).await?,
            fifo_depth: self.store.list_len(&self.keys.fifo_queue()).await?,
            pending_callbacks: self.pending_count().await?,
            active_workers: self.active_workers().await?.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_request, memory_queue};
    use switchback_core::WorkerId;

    #[tokio::test]
    async fn test_stats_count_each_structure() {
        let (queue, _store) = memory_queue();

        queue.enqueue(make_request(0)).await.unwrap();
        queue.enqueue(make_request(0)).await.unwrap();
        let expedited = queue.enqueue(make_request(3)).await.unwrap();
        queue.register(&WorkerId::new("w1")).await.unwrap();
        queue
            .schedule_retry(expedited, chrono::Utc::now())
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.priority_depth, 1);
        assert_eq!(stats.fifo_depth, 2);
        assert_eq!(stats.queue_depth(), 3);
        assert_eq!(stats.pending_callbacks, 1);
        assert_eq!(stats.active_workers, 1);
        assert_eq!(queue.queue_depth().await.unwrap(), 3);
    }
}
