//! The coordination store abstraction.
//!
//! Every piece of shared queue state lives behind this trait. Implementations
//! must make each method a single atomic step as observed by other processes;
//! the queue never layers its own locking on top.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;

/// An entry read back from an append-only stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned position, `<millis>-<seq>`.
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Trait for shared data-structure stores.
///
/// Five kinds of structure are used: hash maps, ordered sets, lists,
/// append-only streams and unordered sets. Any key may carry an expiry.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Name of this store, for logs.
    fn name(&self) -> &'static str;

    // Hash maps

    /// Set the given fields, leaving other fields untouched.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// All fields of a hash. Missing keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set `fields` on an existing hash, but only while `field` holds one of
    /// `expected` (any value when `expected` is `None`).
    ///
    /// Returns the value `field` held when the call was made, or `None` when
    /// the hash or the field does not exist, in which case nothing is written
    /// and no key is created. The write happened exactly when the returned
    /// value is accepted by `expected`.
    async fn hash_set_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[&str]>,
        fields: &[(&str, String)],
    ) -> Result<Option<String>>;

    /// Set (or reset) the time-to-live of any key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remove a key of any kind. Missing keys are fine.
    async fn delete(&self, key: &str) -> Result<()>;

    // Ordered sets

    /// Insert or re-score a member.
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Atomically remove and return the lowest-scored member, optionally only
    /// if its score is at most `max_score`. Ties are broken by member order.
    /// Two concurrent callers never receive the same member.
    async fn atomic_pop_min(
        &self,
        key: &str,
        max_score: Option<f64>,
    ) -> Result<Option<(String, f64)>>;

    /// Returns whether the member was present.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn sorted_len(&self, key: &str) -> Result<u64>;

    // Lists

    /// Append to the tail.
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the head, waiting up to `timeout` for one to arrive. A zero
    /// timeout does not block.
    async fn list_blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    async fn list_len(&self, key: &str) -> Result<u64>;

    // Streams

    /// Append an entry and return its position.
    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> Result<String>;

    /// Read up to `count` entries positioned after `after`, waiting up to
    /// `block` if there are none yet. An empty result is not an error.
    async fn stream_read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    // Unordered sets

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
}
