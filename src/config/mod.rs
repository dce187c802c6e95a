//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The store URL may embed a password, so it is wrapped in
//! secrecy::SecretString to keep it out of logs.

pub mod secrets;

use crate::error::{Error, Result};
use crate::lock::DEFAULT_LEASE;
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub lock_lease: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let lock_lease = match std::env::var("LOCK_LEASE_MS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| Error::Config(format!("LOCK_LEASE_MS must be an integer: {e}")))?,
            Err(_) => DEFAULT_LEASE,
        };

        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            lock_lease,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
