use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep_until;
use uuid::Uuid;

use super::Broker;
use crate::error::Result;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<String>>,
    // Keyed by (negated priority, sequence) so iteration order is
    // pop order: highest priority first, FIFO within a priority.
    priority_queues: HashMap<String, BTreeMap<(i64, u64), String>>,
    sequence: u64,
    hashes: HashMap<String, HashMap<String, String>>,
    deadlines: HashMap<String, BTreeMap<String, i64>>,
    locks: HashMap<String, (String, Instant)>,
}

/// In-process broker with the same ordering guarantees as the Redis one.
///
/// Backs the integration tests and single-process deployments; all state
/// lives behind one mutex, and blocking pops wait on a shared notifier.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker").finish_non_exhaustive()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_queue_pop(&self, queue: &str) -> Option<String> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.queues.get_mut(queue).and_then(VecDeque::pop_front)
    }

    fn try_priority_pop(&self, queue: &str) -> Option<String> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let entries = state.priority_queues.get_mut(queue)?;
        let key = entries.keys().next().copied()?;
        entries.remove(&key)
    }

    /// Blocking-pop scaffold shared by both queue kinds. Registers interest
    /// in the notifier before each poll so a concurrent push cannot be
    /// missed between the poll and the wait.
    async fn pop_with_timeout<F>(
        &self,
        timeout: Duration,
        mut try_pop: F,
    ) -> Option<String>
    where
        F: FnMut() -> Option<String>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = try_pop() {
                return Some(value);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = sleep_until(deadline) => return None,
            }
        }
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn queue_push(&self, queue: &str, payload: String) -> Result<()> {
        {
            let mut state = self.state.lock().expect("broker state poisoned");
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(payload);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn queue_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        if timeout.is_zero() {
            return Ok(self.try_queue_pop(queue));
        }
        Ok(self
            .pop_with_timeout(timeout, || self.try_queue_pop(queue))
            .await)
    }

    async fn queue_length(&self, queue: &str) -> Result<u64> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state.queues.get(queue).map(VecDeque::len).unwrap_or(0) as u64)
    }

    async fn queue_delete(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.queues.remove(queue);
        Ok(())
    }

    async fn priority_push(
        &self,
        queue: &str,
        priority: u32,
        payload: String,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().expect("broker state poisoned");
            state.sequence += 1;
            let sequence = state.sequence;
            state
                .priority_queues
                .entry(queue.to_string())
                .or_default()
                .insert((-(priority as i64), sequence), payload);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn priority_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        if timeout.is_zero() {
            return Ok(self.try_priority_pop(queue));
        }
        Ok(self
            .pop_with_timeout(timeout, || self.try_priority_pop(queue))
            .await)
    }

    async fn priority_count(
        &self,
        queue: &str,
        lo: u32,
        hi: u32,
    ) -> Result<u64> {
        let state = self.state.lock().expect("broker state poisoned");
        let Some(entries) = state.priority_queues.get(queue) else {
            return Ok(0);
        };
        let count = entries
            .keys()
            .filter(|(neg_priority, _)| {
                let priority = (-neg_priority) as u32;
                (lo..=hi).contains(&priority)
            })
            .count();
        Ok(count as u64)
    }

    async fn hash_set(
        &self,
        hash: &str,
        key: &str,
        value: String,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn hash_set_if_absent(
        &self,
        hash: &str,
        key: &str,
        value: String,
    ) -> Result<bool> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let fields = state.hashes.entry(hash.to_string()).or_default();
        if fields.contains_key(key) {
            return Ok(false);
        }
        fields.insert(key.to_string(), value);
        Ok(true)
    }

    async fn hash_get(&self, hash: &str, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state
            .hashes
            .get(hash)
            .and_then(|fields| fields.get(key))
            .cloned())
    }

    async fn hash_pop(&self, hash: &str, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        Ok(state
            .hashes
            .get_mut(hash)
            .and_then(|fields| fields.remove(key)))
    }

    async fn hash_remove(&self, hash: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if let Some(fields) = state.hashes.get_mut(hash) {
            fields.remove(key);
        }
        Ok(())
    }

    async fn hash_incr(
        &self,
        hash: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let fields = state.hashes.entry(hash.to_string()).or_default();
        let current: i64 = fields
            .get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let next = current + delta;
        fields.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_len(&self, hash: &str) -> Result<u64> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state.hashes.get(hash).map(HashMap::len).unwrap_or(0) as u64)
    }

    async fn hash_keys(&self, hash: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state
            .hashes
            .get(hash)
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_get_all(
        &self,
        hash: &str,
    ) -> Result<Vec<(String, String)>> {
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state
            .hashes
            .get(hash)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hash_delete(&self, hash: &str) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.hashes.remove(hash);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("broker state poisoned");
        let mut keys: Vec<String> = state
            .queues
            .keys()
            .chain(state.hashes.keys())
            .chain(state.deadlines.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn deadline_set(
        &self,
        set: &str,
        key: &str,
        at_ms: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state
            .deadlines
            .entry(set.to_string())
            .or_default()
            .insert(key.to_string(), at_ms);
        Ok(())
    }

    async fn deadline_remove(&self, set: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if let Some(entries) = state.deadlines.get_mut(set) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn deadline_pop_due(
        &self,
        set: &str,
        now_ms: i64,
    ) -> Result<Vec<String>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let Some(entries) = state.deadlines.get_mut(set) else {
            return Ok(Vec::new());
        };
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, at)| **at <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            entries.remove(key);
        }
        Ok(due)
    }

    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        state
            .locks
            .insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn lock_release(&self, name: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if let Some((held, _)) = state.locks.get(name) {
            if held == token {
                state.locks.remove(name);
            }
        }
        Ok(())
    }
}
