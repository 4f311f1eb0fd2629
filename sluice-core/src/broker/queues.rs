use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Broker;
use crate::error::Result;

/// Typed front over a named FIFO queue.
pub struct NamedQueue<T> {
    broker: Arc<dyn Broker>,
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for NamedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedQueue").field("name", &self.name).finish()
    }
}

impl<T> Clone for NamedQueue<T> {
    fn clone(&self) -> Self {
        NamedQueue {
            broker: self.broker.clone(),
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> NamedQueue<T> {
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>) -> Self {
        NamedQueue {
            broker,
            name: name.into(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push(&self, payload: &T) -> Result<()> {
        let raw = serde_json::to_string(payload)?;
        self.broker.queue_push(&self.name, raw).await
    }

    pub async fn pop(&self, timeout: Duration) -> Result<Option<T>> {
        match self.broker.queue_pop(&self.name, timeout).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn length(&self) -> Result<u64> {
        self.broker.queue_length(&self.name).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.broker.queue_delete(&self.name).await
    }
}

/// Typed front over the priority queue: strict priority order, FIFO within
/// a priority.
pub struct PriorityQueue<T> {
    broker: Arc<dyn Broker>,
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("name", &self.name)
            .finish()
    }
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        PriorityQueue {
            broker: self.broker.clone(),
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> PriorityQueue<T> {
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>) -> Self {
        PriorityQueue {
            broker,
            name: name.into(),
            _payload: PhantomData,
        }
    }

    pub async fn push(&self, priority: u32, payload: &T) -> Result<()> {
        let raw = serde_json::to_string(payload)?;
        self.broker.priority_push(&self.name, priority, raw).await
    }

    pub async fn pop(&self, timeout: Duration) -> Result<Option<T>> {
        match self.broker.priority_pop(&self.name, timeout).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self, lo: u32, hi: u32) -> Result<u64> {
        self.broker.priority_count(&self.name, lo, hi).await
    }
}

/// Typed front over a hash table.
pub struct HashTable<T> {
    broker: Arc<dyn Broker>,
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for HashTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable").field("name", &self.name).finish()
    }
}

impl<T> Clone for HashTable<T> {
    fn clone(&self) -> Self {
        HashTable {
            broker: self.broker.clone(),
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> HashTable<T> {
    pub fn new(broker: Arc<dyn Broker>, name: impl Into<String>) -> Self {
        HashTable {
            broker,
            name: name.into(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.broker.hash_set(&self.name, key, raw).await
    }

    /// Insert only when absent; returns whether this writer won.
    pub async fn add(&self, key: &str, value: &T) -> Result<bool> {
        let raw = serde_json::to_string(value)?;
        self.broker.hash_set_if_absent(&self.name, key, raw).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        match self.broker.hash_get(&self.name, key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.broker.hash_get(&self.name, key).await?.is_some())
    }

    pub async fn pop(&self, key: &str) -> Result<Option<T>> {
        match self.broker.hash_pop(&self.name, key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.broker.hash_remove(&self.name, key).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.broker.hash_len(&self.name).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.broker.hash_keys(&self.name).await
    }

    pub async fn entries(&self) -> Result<Vec<(String, T)>> {
        let raw = self.broker.hash_get_all(&self.name).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            entries.push((key, serde_json::from_str(&value)?));
        }
        Ok(entries)
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.broker.hash_delete(&self.name).await
    }
}
