//! Append-only operation history.
//!
//! Rows start as `started` and must end terminal (`success`, `failed` or
//! `warning`). Text columns are sanitized before they get here.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::records::{HistoryEntry, HistoryStatus, HostAction};
use super::Database;
use crate::constants::history::OUTPUT_TRUNCATE_CHARS;

impl Database {
    /// Insert a `started` row and return its id.
    pub async fn start_history(
        &self,
        host_id: &str,
        action: HostAction,
        manager: &str,
        command: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO update_history (id, host_id, action, manager, status, command, started_at)
            VALUES (?, ?, ?, ?, 'started', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(host_id)
        .bind(action.as_str())
        .bind(manager)
        .bind(command)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Move a row to a terminal status.
    pub async fn finish_history(
        &self,
        id: &str,
        status: HistoryStatus,
        output: &str,
        error: Option<&str>,
        packages: &[String],
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        sqlx::query(
            r#"
            UPDATE update_history
            SET status = ?, output = ?, error = ?, package_count = ?, packages = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(truncate(output))
        .bind(error)
        .bind(packages.len() as i64)
        .bind(serde_json::to_string(packages)?)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Insert an already-terminal row in one go (checks summarise per
    /// manager after the fact).
    #[allow(clippy::too_many_arguments)]
    pub async fn record_history(
        &self,
        host_id: &str,
        action: HostAction,
        manager: &str,
        status: HistoryStatus,
        command: &str,
        output: &str,
        error: Option<&str>,
        packages: &[String],
    ) -> Result<String> {
        let id = self.start_history(host_id, action, manager, command).await?;
        self.finish_history(&id, status, output, error, packages)
            .await?;
        Ok(id)
    }

    pub async fn host_history(&self, host_id: &str, limit: i64) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM update_history WHERE host_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(host_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    /// Startup recovery: no row may stay `started` across a restart.
    pub(super) async fn fail_interrupted_history(&self) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE update_history
            SET status = 'failed', error = 'server restarted', completed_at = ?
            WHERE status = 'started'
            "#,
        )
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn truncate(output: &str) -> String {
    if output.chars().count() <= OUTPUT_TRUNCATE_CHARS {
        return output.to_string();
    }
    let kept: String = output.chars().take(OUTPUT_TRUNCATE_CHARS).collect();
    format!("{kept}\n[output truncated]")
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry> {
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    let packages: String = row.try_get("packages")?;
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        host_id: row.try_get("host_id")?,
        action: HostAction::parse(&action),
        manager: row.try_get("manager")?,
        status: HistoryStatus::parse(&status),
        command: row.try_get("command")?,
        output: row.try_get("output")?,
        error: row.try_get("error")?,
        package_count: row.try_get("package_count")?,
        packages: serde_json::from_str(&packages).unwrap_or_default(),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
