//! Shared helpers for the queue tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchback_config::QueueConfig;
use switchback_core::{
    BuildConfig, BuildStrategy, CoordinationStore, Error, NewJob, Result, StreamEntry,
};
use switchback_store::MemoryStore;
use uuid::Uuid;

use crate::BuildQueue;

pub fn make_request(priority: u32) -> NewJob {
    NewJob {
        release_id: Uuid::new_v4(),
        service_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        git_repo: "https://github.com/acme/api.git".to_string(),
        git_sha: "abc1234".to_string(),
        git_branch: "main".to_string(),
        build_config: BuildConfig {
            strategy: BuildStrategy::Dockerfile,
            dockerfile: Some("Dockerfile".to_string()),
            context: ".".to_string(),
            ..Default::default()
        },
        callback_url: None,
        priority,
    }
}

pub fn memory_queue() -> (Arc<BuildQueue>, Arc<MemoryStore>) {
    memory_queue_with(QueueConfig::default())
}

pub fn memory_queue_with(config: QueueConfig) -> (Arc<BuildQueue>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(BuildQueue::new(store.clone(), config));
    (queue, store)
}

/// A [`MemoryStore`] that lets a test slip another process's write in right
/// after a read, or make one read fail.
#[derive(Default)]
pub struct RacingStore {
    inner: MemoryStore,
    after_read: Mutex<Option<(String, String, String)>>,
    failing_read: Mutex<Option<String>>,
}

impl RacingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` to `value` once the next read of `key` has returned.
    pub fn write_after_next_read(&self, key: &str, field: &str, value: &str) {
        *self.after_read.lock().unwrap() =
            Some((key.to_string(), field.to_string(), value.to_string()));
    }

    /// Make the next field read of `key` fail as if the store were down.
    pub fn fail_next_read(&self, key: &str) {
        *self.failing_read.lock().unwrap() = Some(key.to_string());
    }

    async fn race(&self, key: &str) -> Result<()> {
        let pending = {
            let mut slot = self.after_read.lock().unwrap();
            if slot.as_ref().is_some_and(|(target, _, _)| target == key) {
                slot.take()
            } else {
                None
            }
        };
        if let Some((key, field, value)) = pending {
            self.inner.hash_set(&key, &[(field.as_str(), value)]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for RacingStore {
    fn name(&self) -> &'static str {
        "racing"
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.inner.hash_set(key, fields).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let fail = {
            let mut slot = self.failing_read.lock().unwrap();
            if slot.as_deref() == Some(key) {
                slot.take()
            } else {
                None
            }
        };
        if fail.is_some() {
            return Err(Error::StoreUnavailable("connection reset".to_string()));
        }

        let value = self.inner.hash_get(key, field).await?;
        self.race(key).await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let fields = self.inner.hash_get_all(key).await?;
        self.race(key).await?;
        Ok(fields)
    }

    async fn hash_set_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[&str]>,
        fields: &[(&str, String)],
    ) -> Result<Option<String>> {
        self.inner.hash_set_if(key, field, expected, fields).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.inner.expire(key, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.sorted_add(key, member, score).await
    }

    async fn atomic_pop_min(
        &self,
        key: &str,
        max_score: Option<f64>,
    ) -> Result<Option<(String, f64)>> {
        self.inner.atomic_pop_min(key, max_score).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.sorted_remove(key, member).await
    }

    async fn sorted_len(&self, key: &str) -> Result<u64> {
        self.inner.sorted_len(key).await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.inner.list_push(key, value).await
    }

    async fn list_blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        self.inner.list_blocking_pop(key, timeout).await
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        self.inner.list_len(key).await
    }

    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> Result<String> {
        self.inner.stream_append(key, fields).await
    }

    async fn stream_read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.inner.stream_read(key, after, count, block).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.inner.set_members(key).await
    }
}
