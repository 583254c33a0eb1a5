//! SQLite persistence layer.
//!
//! The store is the single source of truth; in-memory state (host locks,
//! live-bus buffers, active operations) is rebuilt empty on restart.
//! Submodules group operations by concern:
//! - `records` - entity types
//! - `hosts` - host registry and system facts
//! - `updates` - per-host update cache
//! - `history` - append-only operation ledger
//! - `channels` - notification channel storage
//! - `settings` - key/value settings

pub mod channels;
pub mod history;
pub mod hosts;
pub mod records;
pub mod settings;
pub mod updates;

use anyhow::Result;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

use crate::vault::CredentialVault;

pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Expose pool for integration test queries
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let database_url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePool::connect(&database_url).await?;
        let database = Self { pool };

        database.initialize_tables().await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&database.pool)
            .await?;

        // Crash recovery: any history row still `started` belongs to a
        // process that no longer exists.
        let recovered = database.fail_interrupted_history().await?;
        if recovered > 0 {
            warn!(
                "Marked {} interrupted history rows as failed after restart",
                recovered
            );
        }

        info!("Database initialized at {}", database_path);
        Ok(database)
    }

    async fn initialize_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hostname TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 22,
                username TEXT NOT NULL,
                auth_mode TEXT NOT NULL DEFAULT 'password',
                enc_password TEXT,
                enc_private_key TEXT,
                enc_key_passphrase TEXT,
                enc_sudo_password TEXT,
                detected_managers TEXT NOT NULL DEFAULT '[]',
                disabled_managers TEXT NOT NULL DEFAULT '[]',
                sudo_available BOOLEAN NOT NULL DEFAULT 0,
                reachability TEXT NOT NULL DEFAULT 'unknown',
                last_seen DATETIME,
                os_name TEXT,
                kernel TEXT,
                fact_hostname TEXT,
                uptime_seconds INTEGER,
                arch TEXT,
                cpu_cores INTEGER,
                memory_bytes INTEGER,
                disk_total_bytes INTEGER,
                disk_free_bytes INTEGER,
                needs_reboot BOOLEAN NOT NULL DEFAULT 0,
                last_notified_fingerprint TEXT,
                exclude_from_bulk BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE(hostname, port, username)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                manager TEXT NOT NULL,
                package TEXT NOT NULL,
                current_version TEXT,
                new_version TEXT,
                architecture TEXT,
                repository TEXT,
                is_security BOOLEAN NOT NULL DEFAULT 0,
                cached_at DATETIME NOT NULL,
                UNIQUE(host_id, manager, package)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_update_cache_host ON update_cache(host_id, cached_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_history (
                id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                action TEXT NOT NULL,
                manager TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                command TEXT NOT NULL DEFAULT '',
                output TEXT NOT NULL DEFAULT '',
                error TEXT,
                package_count INTEGER NOT NULL DEFAULT 0,
                packages TEXT NOT NULL DEFAULT '[]',
                started_at DATETIME NOT NULL,
                completed_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_host_started ON update_history(host_id, started_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_status ON update_history(status, started_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                provider TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                notify_updates BOOLEAN NOT NULL DEFAULT 1,
                notify_unreachable BOOLEAN NOT NULL DEFAULT 0,
                host_scope TEXT,
                config TEXT NOT NULL DEFAULT '{}',
                schedule TEXT NOT NULL DEFAULT 'immediate',
                pending_events TEXT NOT NULL DEFAULT '[]',
                last_sent_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One-shot vault migration: re-encrypt every stored token from the
    /// legacy key to the current one. Invoked at startup when a fresh salt
    /// file was just created and encrypted data already exists.
    pub async fn reencrypt_all(
        &self,
        old_vault: &CredentialVault,
        new_vault: &CredentialVault,
    ) -> Result<usize> {
        let mut migrated = 0usize;
        migrated += self.reencrypt_host_credentials(old_vault, new_vault).await?;
        migrated += self.reencrypt_channel_secrets(old_vault, new_vault).await?;
        if migrated > 0 {
            info!("Re-encrypted {} stored secrets with the new salt", migrated);
        }
        Ok(migrated)
    }

    /// Whether any encrypted blobs exist (decides if migration is needed).
    pub async fn has_encrypted_data(&self) -> Result<bool> {
        let host_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM hosts WHERE enc_password IS NOT NULL OR enc_private_key IS NOT NULL OR enc_key_passphrase IS NOT NULL OR enc_sudo_password IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        if host_count > 0 {
            return Ok(true);
        }
        let channel_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notification_channels")
                .fetch_one(&self.pool)
                .await?;
        Ok(channel_count > 0)
    }
}
