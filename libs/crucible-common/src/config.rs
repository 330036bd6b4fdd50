// Shared settings for everything that talks to the job queue

use anyhow::{Context, Result};
use std::str::FromStr;

/// Read `key` through `lookup`, parsing it or falling back to `default`.
///
/// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map instead.
pub fn setting_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        _ => Ok(default),
    }
}

pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub redis_url: String,
    pub queue_name: String,
    pub result_ttl_secs: u64,
}

impl QueueSettings {
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            redis_url: setting_or(lookup, "REDIS_URL", "redis://127.0.0.1:6379".to_string())?,
            queue_name: setting_or(lookup, "QUEUE_NAME", "judge-queue".to_string())?,
            result_ttl_secs: setting_or(lookup, "RESULT_TTL_SECS", 86_400u64)?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }
}
