//! Key-value store abstraction.
//!
//! The lock and the queue only ever talk to the store through
//! [`KeyValueStore`]. Every multi-step transition is expressed as a
//! [`Batch`] so that the backend can apply it as one atomic unit.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A single write inside an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Prepend `value` to `list`.
    LPush { list: String, value: Vec<u8> },
    /// Remove every occurrence of `value` from `list`.
    LRem { list: String, value: Vec<u8> },
    /// Set `field` of `hash` to `value`.
    HSet {
        hash: String,
        field: Vec<u8>,
        value: Vec<u8>,
    },
    /// Delete `field` from `hash`.
    HDel { hash: String, field: Vec<u8> },
}

/// Precondition checked by the store at the moment a batch is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// `field` must not be present in `hash`.
    FieldAbsent { hash: String, field: Vec<u8> },
}

/// Commands applied all-or-nothing, optionally behind a [`Guard`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub guard: Option<Guard>,
    pub commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only apply the batch if `field` is absent from `hash`.
    pub fn unless_field_exists(mut self, hash: &str, field: &[u8]) -> Self {
        self.guard = Some(Guard::FieldAbsent {
            hash: hash.to_string(),
            field: field.to_vec(),
        });
        self
    }

    pub fn lpush(mut self, list: &str, value: &[u8]) -> Self {
        self.commands.push(Command::LPush {
            list: list.to_string(),
            value: value.to_vec(),
        });
        self
    }

    pub fn lrem(mut self, list: &str, value: &[u8]) -> Self {
        self.commands.push(Command::LRem {
            list: list.to_string(),
            value: value.to_vec(),
        });
        self
    }

    pub fn hset(mut self, hash: &str, field: &[u8], value: &[u8]) -> Self {
        self.commands.push(Command::HSet {
            hash: hash.to_string(),
            field: field.to_vec(),
            value: value.to_vec(),
        });
        self
    }

    pub fn hdel(mut self, hash: &str, field: &[u8]) -> Self {
        self.commands.push(Command::HDel {
            hash: hash.to_string(),
            field: field.to_vec(),
        });
        self
    }
}

/// The store operations the lock and queue rely on.
///
/// Missing lists and hashes behave as empty: lengths are zero and pops
/// return `None`.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Set `key` only if it does not exist. Returns true if it was set.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Overwrite `key` and refresh its TTL only if it exists.
    async fn set_if_present(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Block until `src` has an element, then move its tail to the head of `dst`.
    async fn pop_push_blocking(&self, src: &str, dst: &str) -> Result<Vec<u8>>;

    /// Move the tail of `src` to the head of `dst`, or `None` if `src` is empty.
    async fn pop_push(&self, src: &str, dst: &str) -> Result<Option<Vec<u8>>>;

    async fn llen(&self, list: &str) -> Result<usize>;

    async fn hget(&self, hash: &str, field: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn hexists(&self, hash: &str, field: &[u8]) -> Result<bool>;

    async fn hlen(&self, hash: &str) -> Result<usize>;

    /// Apply a batch atomically. Returns false, without applying anything,
    /// if the batch's guard did not hold.
    async fn exec(&self, batch: Batch) -> Result<bool>;
}
