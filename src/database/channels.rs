//! Notification channel storage.
//!
//! The config column is an opaque JSON object; secret fields inside it are
//! vault tokens by the time they reach this layer (the digester encrypts on
//! write and decrypts on dispatch).

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::records::{DeliverySchedule, NotificationChannel, PendingEvent};
use super::Database;
use crate::vault::CredentialVault;

/// Config fields that hold secrets, per provider type.
pub fn secret_fields(provider: &str) -> &'static [&'static str] {
    match provider {
        "email" => &["pass"],
        "http_push" => &["auth_token"],
        _ => &[],
    }
}

/// Operator input for creating or replacing a channel.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChannelInput {
    pub name: String,
    pub provider: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub notify_updates: bool,
    #[serde(default)]
    pub notify_unreachable: bool,
    #[serde(default)]
    pub host_scope: Option<Vec<String>>,
    pub config: serde_json::Value,
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

fn default_true() -> bool {
    true
}

fn default_schedule() -> String {
    "immediate".to_string()
}

impl Database {
    pub async fn create_channel(&self, input: &ChannelInput) -> Result<NotificationChannel> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO notification_channels (
                id, name, provider, enabled, notify_updates, notify_unreachable,
                host_scope, config, schedule, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.provider)
        .bind(input.enabled)
        .bind(input.notify_updates)
        .bind(input.notify_unreachable)
        .bind(scope_json(&input.host_scope)?)
        .bind(input.config.to_string())
        .bind(&input.schedule)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_channel(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("channel {id} vanished after insert"))
    }

    pub async fn update_channel(&self, id: &str, input: &ChannelInput) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_channels SET
                name = ?, provider = ?, enabled = ?, notify_updates = ?,
                notify_unreachable = ?, host_scope = ?, config = ?, schedule = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&input.name)
        .bind(&input.provider)
        .bind(input.enabled)
        .bind(input.notify_updates)
        .bind(input.notify_unreachable)
        .bind(scope_json(&input.host_scope)?)
        .bind(input.config.to_string())
        .bind(&input.schedule)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<NotificationChannel>> {
        let row = sqlx::query("SELECT * FROM notification_channels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| channel_from_row(&r)).transpose()
    }

    pub async fn list_channels(&self) -> Result<Vec<NotificationChannel>> {
        let rows = sqlx::query("SELECT * FROM notification_channels ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(channel_from_row).collect()
    }

    pub async fn delete_channel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_channels WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_channel_pending(&self, id: &str, pending: &[PendingEvent]) -> Result<()> {
        sqlx::query(
            "UPDATE notification_channels SET pending_events = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(pending)?)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_channel_sent(&self, id: &str, sent_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE notification_channels SET pending_events = '[]', last_sent_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(sent_at)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn reencrypt_channel_secrets(
        &self,
        old_vault: &CredentialVault,
        new_vault: &CredentialVault,
    ) -> Result<usize> {
        let channels = self.list_channels().await?;
        let mut migrated = 0usize;
        for channel in channels {
            let mut config = channel.config.clone();
            let mut changed = false;
            if let Some(object) = config.as_object_mut() {
                for field in secret_fields(&channel.provider) {
                    if let Some(serde_json::Value::String(token)) = object.get(*field) {
                        let plain = old_vault.decrypt(token)?;
                        object.insert(
                            field.to_string(),
                            serde_json::Value::String(new_vault.encrypt(&plain)?),
                        );
                        changed = true;
                    }
                }
            }
            if changed {
                sqlx::query(
                    "UPDATE notification_channels SET config = ?, updated_at = ? WHERE id = ?",
                )
                .bind(config.to_string())
                .bind(Utc::now())
                .bind(&channel.id)
                .execute(self.pool())
                .await?;
                migrated += 1;
            }
        }
        Ok(migrated)
    }
}

fn scope_json(scope: &Option<Vec<String>>) -> Result<Option<String>> {
    Ok(match scope {
        Some(ids) => Some(serde_json::to_string(ids)?),
        None => None,
    })
}

fn channel_from_row(row: &SqliteRow) -> Result<NotificationChannel> {
    let host_scope: Option<String> = row.try_get("host_scope")?;
    let config: String = row.try_get("config")?;
    let schedule: String = row.try_get("schedule")?;
    let pending: String = row.try_get("pending_events")?;
    Ok(NotificationChannel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        enabled: row.try_get("enabled")?,
        notify_updates: row.try_get("notify_updates")?,
        notify_unreachable: row.try_get("notify_unreachable")?,
        host_scope: host_scope
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .unwrap_or_default(),
        config: serde_json::from_str(&config).unwrap_or_else(|_| serde_json::json!({})),
        schedule: DeliverySchedule::parse(&schedule),
        pending_events: serde_json::from_str(&pending).unwrap_or_default(),
        last_sent_at: row.try_get("last_sent_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
