//! # kvsync
//!
//! Coordination primitives on a shared key-value store.
//!
//! Provides a lease-based distributed lock with background renewal
//! ([`lock::DistributedLock`]) and an at-least-once job queue with
//! duplicate suppression and crash recovery ([`queue::JobQueue`]).
//! Both run against any [`store::KeyValueStore`]; Redis and in-memory
//! backends are included.

pub mod config;
pub mod error;
pub mod lock;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use lock::DistributedLock;
pub use queue::{Job, JobQueue, WorkHandle};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
