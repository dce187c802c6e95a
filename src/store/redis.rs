//! Redis-backed store.
//!
//! Plain commands and atomic pipelines share one `ConnectionManager`.
//! Blocking pops and WATCH transactions carry per-connection state, so
//! each of those runs on a dedicated connection. Dedicated connections are
//! kept in a small idle pool and only handed back after a command finished
//! cleanly; one abandoned mid-command (a cancelled blocking `get`) is
//! dropped instead.

use super::{Batch, Command, Guard, KeyValueStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

/// Optimistic retries for a guarded batch before giving up.
const MAX_WATCH_RETRIES: usize = 16;

/// Dedicated connections kept open between uses.
const MAX_IDLE_DEDICATED: usize = 8;

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    idle: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The connection info may carry a password.
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            idle: Arc::default(),
        })
    }

    /// Round-trip a PING.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Number of dedicated connections parked for reuse.
    pub fn idle_connections(&self) -> usize {
        self.idle_pool().len()
    }

    async fn dedicated(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.idle_pool().pop() {
            return Ok(conn);
        }
        debug!("opening dedicated connection");
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }

    /// Park a dedicated connection whose last command completed.
    fn release(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle_pool();
        if idle.len() < MAX_IDLE_DEDICATED {
            idle.push(conn);
        }
    }

    fn idle_pool(&self) -> std::sync::MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    (ttl.as_millis() as u64).max(1)
}

fn pipeline(commands: &[Command]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in commands {
        match command {
            Command::LPush { list, value } => {
                pipe.cmd("LPUSH").arg(list).arg(value.as_slice()).ignore();
            }
            Command::LRem { list, value } => {
                pipe.cmd("LREM").arg(list).arg(0).arg(value.as_slice()).ignore();
            }
            Command::HSet { hash, field, value } => {
                pipe.cmd("HSET")
                    .arg(hash)
                    .arg(field.as_slice())
                    .arg(value.as_slice())
                    .ignore();
            }
            Command::HDel { hash, field } => {
                pipe.cmd("HDEL").arg(hash).arg(field.as_slice()).ignore();
            }
        }
    }
    pipe
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_if_present(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self))]
    async fn pop_push_blocking(&self, src: &str, dst: &str) -> Result<Vec<u8>> {
        let mut conn = self.dedicated().await?;
        let value: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(src)
            .arg(dst)
            .arg(0)
            .query_async(&mut conn)
            .await?;
        self.release(conn);
        value.ok_or_else(|| Error::Store(format!("BRPOPLPUSH on {src} returned nil")))
    }

    async fn pop_push(&self, src: &str, dst: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.rpoplpush(src, dst).await?)
    }

    async fn llen(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(list).await?)
    }

    async fn hget(&self, hash: &str, field: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(hash, field).await?)
    }

    async fn hexists(&self, hash: &str, field: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(hash, field).await?)
    }

    async fn hlen(&self, hash: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.hlen(hash).await?)
    }

    #[instrument(skip(self, batch), fields(commands = batch.commands.len()))]
    async fn exec(&self, batch: Batch) -> Result<bool> {
        let Some(Guard::FieldAbsent { hash, field }) = batch.guard else {
            let mut conn = self.conn.clone();
            let () = pipeline(&batch.commands).query_async(&mut conn).await?;
            return Ok(true);
        };

        let mut conn = self.dedicated().await?;
        for attempt in 0..MAX_WATCH_RETRIES {
            let () = redis::cmd("WATCH").arg(&hash).query_async(&mut conn).await?;

            let exists: bool = conn.hexists(&hash, field.as_slice()).await?;
            if exists {
                let () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                self.release(conn);
                return Ok(false);
            }

            // EXEC replies nil when the watched hash changed underneath us.
            let applied: Option<()> = pipeline(&batch.commands)
                .query_async(&mut conn)
                .await?;
            if applied.is_some() {
                self.release(conn);
                return Ok(true);
            }
            debug!(hash = %hash, attempt, "watched hash changed, retrying batch");
        }

        // EXEC cleared the watch on every aborted attempt.
        self.release(conn);
        Err(Error::Store(format!(
            "guarded batch on {hash} aborted {MAX_WATCH_RETRIES} times"
        )))
    }
}
