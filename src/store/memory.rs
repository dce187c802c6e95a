//! In-process key-value store.
//!
//! Intended for tests and local dev. TTLs run on the tokio clock so lease
//! expiry can be driven with a paused runtime.

use super::{Batch, Command, Guard, KeyValueStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, (Vec<u8>, Instant)>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    hashes: HashMap<String, HashMap<Vec<u8>, Vec<u8>>>,
}

impl Inner {
    fn live_string(&mut self, key: &str) -> bool {
        match self.strings.get(key) {
            Some((_, expires_at)) if *expires_at > Instant::now() => true,
            Some(_) => {
                self.strings.remove(key);
                false
            }
            None => false,
        }
    }

    fn pop_push(&mut self, src: &str, dst: &str) -> Option<Vec<u8>> {
        let value = self.lists.get_mut(src)?.pop_back()?;
        if self.lists.get(src).is_some_and(VecDeque::is_empty) {
            self.lists.remove(src);
        }
        self.lists
            .entry(dst.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::LPush { list, value } => {
                self.lists.entry(list).or_default().push_front(value);
            }
            Command::LRem { list, value } => {
                if let Some(items) = self.lists.get_mut(&list) {
                    items.retain(|v| *v != value);
                    if items.is_empty() {
                        self.lists.remove(&list);
                    }
                }
            }
            Command::HSet { hash, field, value } => {
                self.hashes.entry(hash).or_default().insert(field, value);
            }
            Command::HDel { hash, field } => {
                if let Some(fields) = self.hashes.get_mut(&hash) {
                    fields.remove(&field);
                    if fields.is_empty() {
                        self.hashes.remove(&hash);
                    }
                }
            }
        }
    }
}

/// Store backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pushed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delete a string key as if its TTL had run out.
    pub fn remove_key(&self, key: &str) -> bool {
        self.lock().strings.remove(key).is_some()
    }

    /// Whether a string key is currently live.
    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live_string(key)
    }

    /// Snapshot of a list, head first.
    pub fn list(&self, list: &str) -> Vec<Vec<u8>> {
        self.lock()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Store("memory store unavailable".to_string()))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut inner = self.lock();
        if inner.live_string(key) {
            return Ok(false);
        }
        inner
            .strings
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(true)
    }

    async fn set_if_present(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut inner = self.lock();
        if !inner.live_string(key) {
            return Ok(false);
        }
        inner
            .strings
            .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(true)
    }

    async fn pop_push_blocking(&self, src: &str, dst: &str) -> Result<Vec<u8>> {
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_push(src, dst).await? {
                return Ok(value);
            }
            notified.await;
        }
    }

    async fn pop_push(&self, src: &str, dst: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let moved = self.lock().pop_push(src, dst);
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn llen(&self, list: &str) -> Result<usize> {
        self.check()?;
        Ok(self.lock().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn hget(&self, hash: &str, field: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self
            .lock()
            .hashes
            .get(hash)
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn hexists(&self, hash: &str, field: &[u8]) -> Result<bool> {
        self.check()?;
        Ok(self
            .lock()
            .hashes
            .get(hash)
            .is_some_and(|fields| fields.contains_key(field)))
    }

    async fn hlen(&self, hash: &str) -> Result<usize> {
        self.check()?;
        Ok(self.lock().hashes.get(hash).map_or(0, HashMap::len))
    }

    async fn exec(&self, batch: Batch) -> Result<bool> {
        self.check()?;
        let pushes = batch
            .commands
            .iter()
            .any(|c| matches!(c, Command::LPush { .. }));
        {
            let mut inner = self.lock();
            if let Some(Guard::FieldAbsent { hash, field }) = &batch.guard {
                let present = inner
                    .hashes
                    .get(hash)
                    .is_some_and(|fields| fields.contains_key(field));
                if present {
                    return Ok(false);
                }
            }
            for command in batch.commands {
                inner.apply(command);
            }
        }
        if pushes {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }
}
