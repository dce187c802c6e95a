//! kvsync CLI: operator interface to locks and queues.

use clap::{Parser, Subcommand};
use kvsync::config::Config;
use kvsync::config::secrets::ExposeSecret;
use kvsync::telemetry::{TelemetryConfig, init_telemetry};
use kvsync::{DistributedLock, Error, JobQueue, RedisStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kvsync", about = "Lease locks and job queues on Redis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Job queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Lock operations
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show waiting, processing and indexed counts
    Stats {
        /// Queue name
        name: String,
    },
    /// Return in-progress jobs to the waiting list (no consumers may be running)
    Cleanup {
        /// Queue name
        name: String,
    },
    /// Submit a JSON job
    Submit {
        /// Queue name
        name: String,
        /// Job payload as JSON
        job: String,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Acquire a lock, hold it, then release it
    Probe {
        /// Lock key
        key: String,
        /// Give up after this many milliseconds
        #[arg(long)]
        wait_ms: Option<u64>,
        /// How long to hold the lock once acquired
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "kvsync".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = Arc::new(RedisStore::connect(config.redis_url.expose_secret()).await?);
    store.health_check().await?;

    match cli.command {
        Command::Queue { action } => match action {
            QueueAction::Stats { name } => cmd_queue_stats(store, name).await,
            QueueAction::Cleanup { name } => cmd_queue_cleanup(store, name).await,
            QueueAction::Submit { name, job } => cmd_queue_submit(store, name, job).await,
        },
        Command::Lock { action } => match action {
            LockAction::Probe {
                key,
                wait_ms,
                hold_ms,
            } => cmd_lock_probe(store, &config, key, wait_ms, hold_ms).await,
        },
    }
}

async fn cmd_queue_stats(store: Arc<RedisStore>, name: String) -> anyhow::Result<()> {
    let queue = JobQueue::new(store, name);
    let stats = queue.stats().await?;
    println!("Queue:       {}", queue.name());
    println!("Waiting:     {}", stats.waiting);
    println!("Processing:  {}", stats.processing);
    println!("Outstanding: {}", stats.indexed);
    Ok(())
}

async fn cmd_queue_cleanup(store: Arc<RedisStore>, name: String) -> anyhow::Result<()> {
    let queue = JobQueue::new(store, name);
    let moved = queue.cleanup().await?;
    println!("Moved {moved} job(s) back to {}", queue.name());
    Ok(())
}

async fn cmd_queue_submit(store: Arc<RedisStore>, name: String, job: String) -> anyhow::Result<()> {
    let job: serde_json::Value = serde_json::from_str(&job)?;
    let queue = JobQueue::new(store, name);
    match queue.submit(&job).await {
        Ok(()) => println!("queued"),
        Err(Error::AlreadyQueued) => println!("already queued"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_lock_probe(
    store: Arc<RedisStore>,
    config: &Config,
    key: String,
    wait_ms: Option<u64>,
    hold_ms: u64,
) -> anyhow::Result<()> {
    let lock = DistributedLock::new(store, key).with_lease(config.lock_lease);

    let acquired = match wait_ms {
        Some(ms) => lock.lock_wait(Duration::from_millis(ms)).await,
        None => lock.lock().await,
    };
    match acquired {
        Ok(()) => {}
        Err(Error::LockTimeout) => anyhow::bail!("timed out waiting for lock '{}'", lock.key()),
        Err(e) => return Err(e.into()),
    }
    println!("Acquired '{}' (lease {:?})", lock.key(), lock.lease());

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {}
        lost = lock.lost() => {
            anyhow::bail!("lock lost while held: {lost}");
        }
    }

    lock.unlock().await?;
    println!("Released '{}'", lock.key());
    Ok(())
}
