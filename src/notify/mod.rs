//! Notification digester.
//!
//! Takes batches of check outcomes from the scheduler, suppresses
//! duplicates by fingerprinting each host's update set, and fans the
//! surviving events out to the configured channels: immediate ones
//! dispatch right away, cron-scheduled ones accumulate pending events that
//! flush when their next slot after `last_sent_at` has passed.

pub mod providers;
pub mod ssrf;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::database::channels::{secret_fields, ChannelInput};
use crate::database::records::{DeliverySchedule, NotificationChannel, PendingEvent};
use crate::database::Database;
use crate::vault::CredentialVault;
use self::providers::{NotificationPayload, Priority};

pub use crate::database::records::STORED_MARKER;

/// One host's outcome from a scheduler sweep.
#[derive(Debug, Clone)]
pub struct CheckEvent {
    pub host_id: String,
    pub host_name: String,
    pub update_count: usize,
    pub security_count: usize,
    pub previously_reachable: bool,
    pub now_unreachable: bool,
}

pub struct Notifier {
    database: Arc<Database>,
    vault: Arc<CredentialVault>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(database: Arc<Database>, vault: Arc<CredentialVault>) -> Self {
        // Redirects stay off so a vetted push URL cannot bounce to an
        // internal address.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build notification HTTP client");
        Self {
            database,
            vault,
            client,
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Digest one sweep's worth of check outcomes.
    pub async fn dispatch_batch(&self, events: &[CheckEvent]) -> Result<()> {
        let mut selected: Vec<PendingEvent> = Vec::new();

        for event in events {
            if event.now_unreachable {
                // Only the reachable -> unreachable edge is interesting.
                if event.previously_reachable {
                    selected.push(PendingEvent {
                        host_id: event.host_id.clone(),
                        host_name: event.host_name.clone(),
                        update_count: 0,
                        security_count: 0,
                        unreachable: true,
                    });
                }
                continue;
            }

            if event.update_count == 0 {
                continue;
            }

            let updates = self.database.cached_updates(&event.host_id).await?;
            let mut names: Vec<&str> = updates.iter().map(|u| u.package.as_str()).collect();
            names.sort_unstable();
            let fingerprint =
                update_fingerprint(event.update_count, event.security_count, &names);

            let host = self.database.get_host(&event.host_id).await?;
            let previous = host.and_then(|h| h.last_notified_fingerprint);
            if previous.as_deref() == Some(fingerprint.as_str()) {
                continue;
            }
            self.database
                .set_last_notified_fingerprint(&event.host_id, &fingerprint)
                .await?;

            selected.push(PendingEvent {
                host_id: event.host_id.clone(),
                host_name: event.host_name.clone(),
                update_count: event.update_count,
                security_count: event.security_count,
                unreachable: false,
            });
        }

        if selected.is_empty() {
            return Ok(());
        }

        for channel in self.database.list_channels().await? {
            if !channel.enabled {
                continue;
            }
            let relevant: Vec<PendingEvent> = selected
                .iter()
                .filter(|e| channel.covers_host(&e.host_id))
                .filter(|e| {
                    if e.unreachable {
                        channel.notify_unreachable
                    } else {
                        channel.notify_updates
                    }
                })
                .cloned()
                .collect();
            if relevant.is_empty() {
                continue;
            }

            match &channel.schedule {
                DeliverySchedule::Immediate => {
                    let payload = payload_from_events(&relevant);
                    if let Err(e) = self.dispatch(&channel, &payload).await {
                        warn!("Dispatch to channel {} failed: {e:#}", channel.name);
                    }
                }
                DeliverySchedule::Cron(_) => {
                    let merged = merge_pending(&channel.pending_events, &relevant);
                    self.database
                        .set_channel_pending(&channel.id, &merged)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Deliver buffered events on every scheduled channel whose cron slot
    /// has come around.
    pub async fn flush_scheduled(&self) -> Result<()> {
        let now = Utc::now();
        for channel in self.database.list_channels().await? {
            let DeliverySchedule::Cron(expression) = &channel.schedule else {
                continue;
            };
            if !channel.enabled || channel.pending_events.is_empty() {
                continue;
            }
            match cron_is_due(expression, channel.last_sent_at, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        "Channel {} has an invalid schedule {:?}: {e}",
                        channel.name, expression
                    );
                    continue;
                }
            }

            let payload = payload_from_events(&channel.pending_events);
            match self.dispatch(&channel, &payload).await {
                Ok(()) => {
                    self.database.mark_channel_sent(&channel.id, now).await?;
                    info!(
                        "Scheduled digest sent on channel {} ({} events)",
                        channel.name,
                        channel.pending_events.len()
                    );
                }
                Err(e) => warn!("Scheduled dispatch on {} failed: {e:#}", channel.name),
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<()> {
        let config = self.decrypted_config(channel)?;
        match channel.provider.as_str() {
            "email" => providers::send_email(&config, payload).await,
            "http_push" => providers::send_http_push(&self.client, &config, payload).await,
            other => anyhow::bail!("unknown provider type {other:?}"),
        }
    }

    /// Send a test notification through a channel as configured.
    pub async fn test_channel(&self, channel_id: &str) -> Result<()> {
        let channel = self
            .database
            .get_channel(channel_id)
            .await?
            .context("channel not found")?;
        let payload = NotificationPayload {
            title: "Test notification".to_string(),
            body: format!("Channel {} is configured correctly.", channel.name),
            priority: Priority::Default,
        };
        self.dispatch(&channel, &payload).await
    }

    // ------------------------------------------------------------------
    // Channel CRUD with secret handling
    // ------------------------------------------------------------------

    pub async fn create_channel(&self, mut input: ChannelInput) -> Result<NotificationChannel> {
        if let DeliverySchedule::Cron(expr) = DeliverySchedule::parse(&input.schedule) {
            Schedule::from_str(&normalize_cron(&expr))
                .map_err(|e| anyhow::anyhow!("invalid cron schedule {expr:?}: {e}"))?;
        }
        input.config = self.seal_config(&input.provider, input.config, None)?;
        let channel = self.database.create_channel(&input).await?;
        Ok(self.masked(channel))
    }

    pub async fn update_channel(
        &self,
        id: &str,
        mut input: ChannelInput,
    ) -> Result<NotificationChannel> {
        let existing = self
            .database
            .get_channel(id)
            .await?
            .context("channel not found")?;
        if let DeliverySchedule::Cron(expr) = DeliverySchedule::parse(&input.schedule) {
            Schedule::from_str(&normalize_cron(&expr))
                .map_err(|e| anyhow::anyhow!("invalid cron schedule {expr:?}: {e}"))?;
        }
        input.config = self.seal_config(&input.provider, input.config, Some(&existing.config))?;
        self.database.update_channel(id, &input).await?;
        let updated = self
            .database
            .get_channel(id)
            .await?
            .context("channel vanished after update")?;
        Ok(self.masked(updated))
    }

    pub async fn list_channels_masked(&self) -> Result<Vec<NotificationChannel>> {
        let channels = self.database.list_channels().await?;
        Ok(channels.into_iter().map(|c| self.masked(c)).collect())
    }

    pub async fn get_channel_masked(&self, id: &str) -> Result<Option<NotificationChannel>> {
        Ok(self.database.get_channel(id).await?.map(|c| self.masked(c)))
    }

    /// Encrypt secret fields on write; `(stored)` means "keep what's there".
    fn seal_config(
        &self,
        provider: &str,
        mut config: serde_json::Value,
        existing: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let Some(object) = config.as_object_mut() else {
            anyhow::bail!("channel config must be a JSON object");
        };
        for field in secret_fields(provider) {
            let Some(serde_json::Value::String(value)) = object.get(*field) else {
                continue;
            };
            if value == STORED_MARKER {
                match existing.and_then(|e| e.get(*field)).cloned() {
                    Some(previous) => {
                        object.insert(field.to_string(), previous);
                    }
                    None => {
                        object.remove(*field);
                    }
                }
            } else if value.is_empty() {
                object.remove(*field);
            } else {
                let sealed = self.vault.encrypt(value)?;
                object.insert(field.to_string(), serde_json::Value::String(sealed));
            }
        }
        Ok(config)
    }

    fn masked(&self, mut channel: NotificationChannel) -> NotificationChannel {
        if let Some(object) = channel.config.as_object_mut() {
            for field in secret_fields(&channel.provider) {
                if object.contains_key(*field) {
                    object.insert(
                        field.to_string(),
                        serde_json::Value::String(STORED_MARKER.to_string()),
                    );
                }
            }
        }
        channel
    }

    fn decrypted_config(&self, channel: &NotificationChannel) -> Result<serde_json::Value> {
        let mut config = channel.config.clone();
        if let Some(object) = config.as_object_mut() {
            for field in secret_fields(&channel.provider) {
                if let Some(serde_json::Value::String(token)) = object.get(*field) {
                    let plain = self.vault.decrypt(token)?;
                    object.insert(field.to_string(), serde_json::Value::String(plain));
                }
            }
        }
        Ok(config)
    }
}

// ----------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------

/// Short digest of a host's update set: count, security count and sorted
/// package names. Equal fingerprints mean "nothing new to say".
pub fn update_fingerprint(count: usize, security_count: usize, sorted_names: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{count}:{security_count}:{}",
        sorted_names.join(",")
    ));
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Merge new events into a pending buffer, coalescing per host by keeping
/// the larger counts.
pub fn merge_pending(existing: &[PendingEvent], incoming: &[PendingEvent]) -> Vec<PendingEvent> {
    let mut merged: Vec<PendingEvent> = existing.to_vec();
    for event in incoming {
        match merged
            .iter_mut()
            .find(|e| e.host_id == event.host_id && e.unreachable == event.unreachable)
        {
            Some(found) => {
                found.host_name = event.host_name.clone();
                found.update_count = found.update_count.max(event.update_count);
                found.security_count = found.security_count.max(event.security_count);
            }
            None => merged.push(event.clone()),
        }
    }
    merged
}

pub fn payload_from_events(events: &[PendingEvent]) -> NotificationPayload {
    let updates: Vec<&PendingEvent> = events.iter().filter(|e| !e.unreachable).collect();
    let unreachable: Vec<&PendingEvent> = events.iter().filter(|e| e.unreachable).collect();

    let total: usize = updates.iter().map(|e| e.update_count).sum();
    let security: usize = updates.iter().map(|e| e.security_count).sum();

    let title = if !updates.is_empty() {
        format!("{total} updates available ({security} security)")
    } else {
        "System(s) unreachable".to_string()
    };

    let mut lines = Vec::new();
    for event in &updates {
        lines.push(format!(
            "{}: {} updates ({} security)",
            event.host_name, event.update_count, event.security_count
        ));
    }
    for event in &unreachable {
        lines.push(format!("{} is unreachable", event.host_name));
    }

    NotificationPayload {
        title,
        body: lines.join("\n"),
        priority: if security > 0 {
            Priority::High
        } else {
            Priority::Default
        },
    }
}

/// Accept 5-field cron by prepending a seconds field; the evaluator wants
/// six or seven fields.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Whether a scheduled channel is due: its next slot strictly after
/// `last_sent_at` (epoch when never sent) is in the past.
pub fn cron_is_due(
    expression: &str,
    last_sent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let schedule = Schedule::from_str(&normalize_cron(expression))?;
    let after = last_sent_at.unwrap_or(DateTime::UNIX_EPOCH);
    Ok(matches!(schedule.after(&after).next(), Some(next) if next <= now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = update_fingerprint(2, 1, &["curl", "openssl"]);
        let b = update_fingerprint(2, 1, &["curl", "openssl"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        assert_ne!(a, update_fingerprint(3, 1, &["curl", "openssl", "vim"]));
        assert_ne!(a, update_fingerprint(2, 2, &["curl", "openssl"]));
        assert_ne!(a, update_fingerprint(2, 1, &["curl", "zlib"]));
    }

    #[test]
    fn merge_keeps_larger_counts() {
        let existing = vec![PendingEvent {
            host_id: "h1".into(),
            host_name: "web-1".into(),
            update_count: 5,
            security_count: 2,
            unreachable: false,
        }];
        let incoming = vec![
            PendingEvent {
                host_id: "h1".into(),
                host_name: "web-1".into(),
                update_count: 3,
                security_count: 4,
                unreachable: false,
            },
            PendingEvent {
                host_id: "h2".into(),
                host_name: "db-1".into(),
                update_count: 1,
                security_count: 0,
                unreachable: false,
            },
        ];
        let merged = merge_pending(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].update_count, 5);
        assert_eq!(merged[0].security_count, 4);
    }

    #[test]
    fn payload_for_updates() {
        let events = vec![
            PendingEvent {
                host_id: "h1".into(),
                host_name: "web-1".into(),
                update_count: 3,
                security_count: 1,
                unreachable: false,
            },
            PendingEvent {
                host_id: "h2".into(),
                host_name: "db-1".into(),
                update_count: 2,
                security_count: 0,
                unreachable: false,
            },
        ];
        let payload = payload_from_events(&events);
        assert_eq!(payload.title, "5 updates available (1 security)");
        assert!(payload.body.contains("web-1: 3 updates (1 security)"));
        assert!(payload.body.contains("db-1: 2 updates (0 security)"));
        assert_eq!(payload.priority, Priority::High);
    }

    #[test]
    fn payload_for_unreachable_only() {
        let events = vec![PendingEvent {
            host_id: "h1".into(),
            host_name: "web-1".into(),
            update_count: 0,
            security_count: 0,
            unreachable: true,
        }];
        let payload = payload_from_events(&events);
        assert_eq!(payload.title, "System(s) unreachable");
        assert!(payload.body.contains("web-1 is unreachable"));
        assert_eq!(payload.priority, Priority::Default);
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert_eq!(normalize_cron("0 8 * * *"), "0 0 8 * * *");
        assert_eq!(normalize_cron("0 0 8 * * *"), "0 0 8 * * *");
    }

    #[test]
    fn never_sent_channel_is_due_immediately() {
        // Next slot after epoch is decades in the past.
        assert!(cron_is_due("0 8 * * *", None, Utc::now()).unwrap());
    }

    #[test]
    fn recently_sent_channel_waits_for_next_slot() {
        let now = Utc::now();
        // Sent just now; a daily slot cannot be due within the same minute
        // unless we happen to sit exactly on it, so pick a slot far away.
        let expr = "0 0 1 1 *"; // Jan 1, 00:00
        let due = cron_is_due(expr, Some(now), now).unwrap();
        assert!(!due || now.format("%m-%d %H:%M").to_string() == "01-01 00:00");
    }

    #[test]
    fn invalid_cron_is_an_error() {
        assert!(cron_is_due("not a cron", None, Utc::now()).is_err());
    }
}
