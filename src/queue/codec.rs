//! Job encoding and store key layout.

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value that can travel through a [`super::JobQueue`].
///
/// By default a job is deduplicated on its full encoded payload. Override
/// [`Job::dedup_key`] to key on a subset of fields instead.
pub trait Job: Serialize + DeserializeOwned + Send + Sync {
    fn dedup_key(&self) -> Option<Vec<u8>> {
        None
    }
}

impl Job for serde_json::Value {}

/// Encodes and decodes job payloads.
pub trait Codec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON payloads via serde_json. Struct fields encode in declaration
/// order, so equal jobs produce equal bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode `job`, returning `(dedup_key, payload)`.
pub(crate) fn marshal<J: Job, C: Codec>(codec: &C, job: &J) -> Result<(Vec<u8>, Vec<u8>)> {
    let payload = codec.encode(job)?;
    let key = job.dedup_key().unwrap_or_else(|| payload.clone());
    Ok((key, payload))
}

/// Store keys for one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub waiting: String,
    pub processing: String,
    pub index: String,
}

impl QueueKeys {
    pub fn new(queue: &str) -> Self {
        Self {
            waiting: queue.to_string(),
            processing: format!("{queue}:processing"),
            index: format!("{queue}:payload"),
        }
    }
}
