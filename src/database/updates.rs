//! Per-host update cache.
//!
//! The cache is fully replaced on every successful check, inside one
//! transaction so readers never observe a partial set.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::records::CachedUpdate;
use super::Database;
use crate::managers::ParsedUpdate;

impl Database {
    /// Atomically replace the cached updates for a host.
    pub async fn replace_cached_updates(
        &self,
        host_id: &str,
        updates: &[ParsedUpdate],
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM update_cache WHERE host_id = ?")
            .bind(host_id)
            .execute(&mut *tx)
            .await?;

        for update in updates {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO update_cache (
                    host_id, manager, package, current_version, new_version,
                    architecture, repository, is_security, cached_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(host_id)
            .bind(&update.manager)
            .bind(&update.package)
            .bind(&update.current_version)
            .bind(&update.new_version)
            .bind(&update.architecture)
            .bind(&update.repository)
            .bind(update.is_security)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn cached_updates(&self, host_id: &str) -> Result<Vec<CachedUpdate>> {
        let rows = sqlx::query(
            "SELECT * FROM update_cache WHERE host_id = ? ORDER BY manager, package",
        )
        .bind(host_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CachedUpdate {
                    host_id: row.try_get("host_id")?,
                    manager: row.try_get("manager")?,
                    package: row.try_get("package")?,
                    current_version: row.try_get("current_version")?,
                    new_version: row.try_get("new_version")?,
                    architecture: row.try_get("architecture")?,
                    repository: row.try_get("repository")?,
                    is_security: row.try_get("is_security")?,
                    cached_at: row.try_get("cached_at")?,
                })
            })
            .collect()
    }

    pub async fn cached_update_count(&self, host_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM update_cache WHERE host_id = ?")
            .bind(host_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count as usize)
    }

    /// Distinct managers present in a host's cache, used to drive upgrades.
    pub async fn cached_managers(&self, host_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar(
            "SELECT DISTINCT manager FROM update_cache WHERE host_id = ? ORDER BY manager",
        )
        .bind(host_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Hosts whose newest cache row is older than the horizon, or that have
    /// never been checked.
    pub async fn stale_host_ids(&self, horizon_hours: u64) -> Result<Vec<String>> {
        let cutoff: DateTime<Utc> = Utc::now() - Duration::hours(horizon_hours as i64);
        let rows = sqlx::query_scalar(
            r#"
            SELECT h.id FROM hosts h
            LEFT JOIN (
                SELECT host_id, MAX(cached_at) AS newest FROM update_cache GROUP BY host_id
            ) c ON c.host_id = h.id
            WHERE c.newest IS NULL OR c.newest < ?
            ORDER BY h.name
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
