//! In-process coordination store.
//!
//! Honours the same contract as the Redis backend inside a single process:
//! one mutex guards all state, so every trait method is atomic, and blocking
//! reads park on a [`Notify`] that every write wakes. Expiry is measured with
//! [`tokio::time::Instant`], which lets tests pause and advance the clock.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use switchback_core::{CoordinationStore, Result, StreamEntry};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::StoreError;

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
    List(VecDeque<String>),
    Stream(Vec<StreamEntry>),
    Set(BTreeSet<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Hash(h) => h.is_empty(),
            Value::Sorted(z) => z.is_empty(),
            Value::List(l) => l.is_empty(),
            // Streams survive being empty, like Redis.
            Value::Stream(_) => false,
            Value::Set(s) => s.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    stream_seq: u64,
}

impl State {
    /// The live entry at `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn value(&mut self, key: &str) -> Option<&mut Value> {
        self.live(key).map(|e| &mut e.value)
    }

    /// The value at `key`, created with `init` when missing.
    fn value_or_insert(&mut self, key: &str, init: fn() -> Value) -> &mut Value {
        self.live(key);
        &mut self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: init(),
                expires_at: None,
            })
            .value
    }

    /// Drop `key` if an operation left its collection empty.
    fn prune(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }
}

fn wrong_type(key: &str) -> switchback_core::Error {
    StoreError::WrongType(key.to_string()).into()
}

fn lowest(members: &HashMap<String, f64>) -> Option<(&String, f64)> {
    members
        .iter()
        .map(|(m, s)| (m, *s))
        .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)))
}

/// Coordination store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    changed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `key` currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live(key).is_some()
    }

    fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        let popped = match state.value(key) {
            None => None,
            Some(Value::List(list)) => list.pop_front(),
            Some(_) => return Err(wrong_type(key)),
        };
        state.prune(key);
        Ok(popped)
    }

    fn read_after(&self, key: &str, after: (u64, u64), count: usize) -> Result<Vec<StreamEntry>> {
        let mut state = self.lock();
        match state.value(key) {
            None => Ok(Vec::new()),
            Some(Value::Stream(entries)) => Ok(entries
                .iter()
                .filter(|e| parse_stream_id(&e.id) > after)
                .take(count)
                .cloned()
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn parse_stream_id(id: &str) -> (u64, u64) {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut state = self.lock();
        match state.value_or_insert(key, || Value::Hash(HashMap::new())) {
            Value::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.to_string(), value.clone());
                }
            }
            _ => return Err(wrong_type(key)),
        }
        state.prune(key);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.lock().value(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.lock().value(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[&str]>,
        fields: &[(&str, String)],
    ) -> Result<Option<String>> {
        let mut state = self.lock();
        let hash = match state.value(key) {
            None => return Ok(None),
            Some(Value::Hash(hash)) => hash,
            Some(_) => return Err(wrong_type(key)),
        };
        let Some(current) = hash.get(field).cloned() else {
            return Ok(None);
        };

        if expected.is_none_or(|allowed| allowed.contains(&current.as_str())) {
            for (name, value) in fields {
                hash.insert(name.to_string(), value.clone());
            }
        }
        Ok(Some(current))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(entry) = self.lock().live(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        {
            let mut state = self.lock();
            match state.value_or_insert(key, || Value::Sorted(HashMap::new())) {
                Value::Sorted(members) => {
                    members.insert(member.to_string(), score);
                }
                _ => return Err(wrong_type(key)),
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn atomic_pop_min(
        &self,
        key: &str,
        max_score: Option<f64>,
    ) -> Result<Option<(String, f64)>> {
        let mut state = self.lock();
        let popped = match state.value(key) {
            None => None,
            Some(Value::Sorted(members)) => {
                let candidate = lowest(members)
                    .filter(|(_, score)| max_score.is_none_or(|max| *score <= max))
                    .map(|(m, s)| (m.clone(), s));
                if let Some((member, _)) = &candidate {
                    members.remove(member);
                }
                candidate
            }
            Some(_) => return Err(wrong_type(key)),
        };
        state.prune(key);
        Ok(popped)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.lock();
        let removed = match state.value(key) {
            None => false,
            Some(Value::Sorted(members)) => members.remove(member).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        state.prune(key);
        Ok(removed)
    }

    async fn sorted_len(&self, key: &str) -> Result<u64> {
        match self.lock().value(key) {
            None => Ok(0),
            Some(Value::Sorted(members)) => Ok(members.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut state = self.lock();
            match state.value_or_insert(key, || Value::List(VecDeque::new())) {
                Value::List(list) => list.push_back(value.to_string()),
                _ => return Err(wrong_type(key)),
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn list_blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait still wakes us.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_front(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        match self.lock().value(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> Result<String> {
        let id = {
            let mut state = self.lock();
            state.stream_seq += 1;
            let id = format!("0-{}", state.stream_seq);
            match state.value_or_insert(key, || Value::Stream(Vec::new())) {
                Value::Stream(entries) => entries.push(StreamEntry {
                    id: id.clone(),
                    fields: fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                }),
                _ => return Err(wrong_type(key)),
            }
            id
        };
        self.changed.notify_waiters();
        Ok(id)
    }

    async fn stream_read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let after = parse_stream_id(after);
        let deadline = Instant::now() + block;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.read_after(key, after, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.lock();
        match state.value_or_insert(key, || Value::Set(BTreeSet::new())) {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.lock();
        match state.value(key) {
            None => {}
            Some(Value::Set(set)) => {
                set.remove(member);
            }
            Some(_) => return Err(wrong_type(key)),
        }
        state.prune(key);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        match self.lock().value(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
