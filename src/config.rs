//! Environment-driven configuration.
//!
//! The reference deployment runs in a container, so everything comes from
//! environment variables with sensible defaults. `LUDASH_ENCRYPTION_KEY` is
//! the only required value: without it stored credentials cannot be
//! decrypted and the process refuses to start.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::constants::{scheduler, ssh, timeouts};

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub database_path: String,
    #[serde(skip_serializing)]
    pub encryption_key: String,
    #[serde(skip_serializing)]
    pub session_secret: Option<String>,
    pub host: String,
    pub port: u16,
    /// Hours after which a host's update cache counts as stale.
    pub cache_horizon_hours: u64,
    /// SSH transport ready timeout in seconds.
    pub ssh_ready_timeout_seconds: u64,
    /// Default per-command timeout in seconds (checks, probes).
    pub command_timeout_seconds: u64,
    /// Cap on concurrently open outbound SSH sessions.
    pub max_ssh_sessions: usize,
    pub public_url: Option<String>,
    pub trust_proxy: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("LUDASH_ENCRYPTION_KEY")
            .context("LUDASH_ENCRYPTION_KEY must be set")?;
        if encryption_key.trim().is_empty() {
            anyhow::bail!("LUDASH_ENCRYPTION_KEY must not be empty");
        }

        Ok(Self {
            database_path: env_or("LUDASH_DB_PATH", "data/ludash.db"),
            encryption_key,
            session_secret: std::env::var("LUDASH_SESSION_SECRET").ok(),
            host: env_or("LUDASH_HOST", "0.0.0.0"),
            port: env_parsed("LUDASH_PORT", 8095)?,
            cache_horizon_hours: env_parsed(
                "LUDASH_CACHE_HOURS",
                scheduler::DEFAULT_CACHE_HORIZON_HOURS,
            )?,
            ssh_ready_timeout_seconds: env_parsed(
                "LUDASH_SSH_READY_TIMEOUT_SECS",
                timeouts::SSH_READY_SECONDS,
            )?,
            command_timeout_seconds: env_parsed(
                "LUDASH_COMMAND_TIMEOUT_SECS",
                timeouts::DEFAULT_COMMAND_SECONDS,
            )?,
            max_ssh_sessions: env_parsed("LUDASH_MAX_SSH_SESSIONS", ssh::DEFAULT_MAX_SESSIONS)?,
            public_url: std::env::var("LUDASH_PUBLIC_URL").ok(),
            trust_proxy: env_parsed("LUDASH_TRUST_PROXY", false)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}
