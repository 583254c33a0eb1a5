//! Database record types (entities).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder serialized instead of stored secrets. Clients send it back
/// on partial updates to mean "keep what is stored".
pub const STORED_MARKER: &str = "(stored)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Password,
    Key,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Password => "password",
            AuthMode::Key => "key",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "key" => AuthMode::Key,
            _ => AuthMode::Password,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Unknown => "unknown",
            Reachability::Reachable => "reachable",
            Reachability::Unreachable => "unreachable",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "reachable" => Reachability::Reachable,
            "unreachable" => Reachability::Unreachable,
            _ => Reachability::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAction {
    Check,
    UpgradeAll,
    FullUpgradeAll,
    UpgradePackage,
    Reboot,
}

impl HostAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostAction::Check => "check",
            HostAction::UpgradeAll => "upgrade_all",
            HostAction::FullUpgradeAll => "full_upgrade_all",
            HostAction::UpgradePackage => "upgrade_package",
            HostAction::Reboot => "reboot",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "upgrade_all" => HostAction::UpgradeAll,
            "full_upgrade_all" => HostAction::FullUpgradeAll,
            "upgrade_package" => HostAction::UpgradePackage,
            "reboot" => HostAction::Reboot,
            _ => HostAction::Check,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Started,
    Success,
    Failed,
    Warning,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Started => "started",
            HistoryStatus::Success => "success",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Warning => "warning",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => HistoryStatus::Success,
            "failed" => HistoryStatus::Failed,
            "warning" => HistoryStatus::Warning,
            _ => HistoryStatus::Started,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Started)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_mode: AuthMode,
    #[serde(serialize_with = "mask_credential")]
    pub enc_password: Option<String>,
    #[serde(serialize_with = "mask_credential")]
    pub enc_private_key: Option<String>,
    #[serde(serialize_with = "mask_credential")]
    pub enc_key_passphrase: Option<String>,
    #[serde(serialize_with = "mask_credential")]
    pub enc_sudo_password: Option<String>,
    pub detected_managers: Vec<String>,
    pub disabled_managers: Vec<String>,
    pub sudo_available: bool,
    pub reachability: Reachability,
    pub last_seen: Option<DateTime<Utc>>,
    pub facts: Option<SystemFacts>,
    pub last_notified_fingerprint: Option<String>,
    pub exclude_from_bulk: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    /// First detected manager, used when the update cache is empty.
    pub fn primary_manager(&self) -> Option<&str> {
        self.detected_managers.first().map(String::as_str)
    }

    /// Detected minus operator-disabled, in detection order.
    pub fn active_managers(&self) -> Vec<String> {
        self.detected_managers
            .iter()
            .filter(|m| !self.disabled_managers.contains(m))
            .cloned()
            .collect()
    }
}

/// Encrypted tokens never leave the process: a set credential serializes
/// as the `(stored)` marker, an unset one as null, so clients can tell
/// which credentials exist and round-trip them through partial updates.
fn mask_credential<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(_) => serializer.serialize_some(STORED_MARKER),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub os_name: Option<String>,
    pub kernel: Option<String>,
    pub hostname: Option<String>,
    pub uptime_seconds: Option<i64>,
    pub arch: Option<String>,
    pub cpu_cores: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub disk_total_bytes: Option<i64>,
    pub disk_free_bytes: Option<i64>,
    pub needs_reboot: bool,
}

/// Operator input for creating a host. Credential fields are plaintext here
/// and encrypted before they touch the database.
#[derive(Debug, Clone, Deserialize)]
pub struct NewHost {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_mode: AuthMode,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_passphrase: Option<String>,
    pub sudo_password: Option<String>,
    #[serde(default)]
    pub exclude_from_bulk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedUpdate {
    pub host_id: String,
    pub manager: String,
    pub package: String,
    pub current_version: Option<String>,
    pub new_version: Option<String>,
    pub architecture: Option<String>,
    pub repository: Option<String>,
    pub is_security: bool,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub host_id: String,
    pub action: HostAction,
    pub manager: String,
    pub status: HistoryStatus,
    pub command: String,
    pub output: String,
    pub error: Option<String>,
    pub package_count: i64,
    pub packages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// When a channel delivers: right away, or batched on a cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "expression")]
pub enum DeliverySchedule {
    Immediate,
    Cron(String),
}

impl DeliverySchedule {
    pub fn as_str(&self) -> String {
        match self {
            DeliverySchedule::Immediate => "immediate".to_string(),
            DeliverySchedule::Cron(expr) => expr.clone(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "immediate" => DeliverySchedule::Immediate,
            expr => DeliverySchedule::Cron(expr.to_string()),
        }
    }
}

/// Event retained in a scheduled channel's buffer until the next cron slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub host_id: String,
    pub host_name: String,
    pub update_count: usize,
    pub security_count: usize,
    pub unreachable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    /// Provider type: `email` or `http_push`.
    pub provider: String,
    pub enabled: bool,
    pub notify_updates: bool,
    pub notify_unreachable: bool,
    /// `None` = all hosts, otherwise an explicit host-id set.
    pub host_scope: Option<Vec<String>>,
    /// Opaque provider config; secret fields are stored encrypted.
    pub config: serde_json::Value,
    pub schedule: DeliverySchedule,
    pub pending_events: Vec<PendingEvent>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationChannel {
    /// Whether this channel covers the given host.
    pub fn covers_host(&self, host_id: &str) -> bool {
        match &self.host_scope {
            None => true,
            Some(ids) => ids.iter().any(|id| id == host_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_managers_excludes_disabled() {
        let host = Host {
            id: "h1".into(),
            name: "web-1".into(),
            hostname: "web-1.example.com".into(),
            port: 22,
            username: "deploy".into(),
            auth_mode: AuthMode::Password,
            enc_password: None,
            enc_private_key: None,
            enc_key_passphrase: None,
            enc_sudo_password: None,
            detected_managers: vec!["apt".into(), "flatpak".into(), "snap".into()],
            disabled_managers: vec!["snap".into()],
            sudo_available: true,
            reachability: Reachability::Unknown,
            last_seen: None,
            facts: None,
            last_notified_fingerprint: None,
            exclude_from_bulk: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(host.active_managers(), vec!["apt", "flatpak"]);
        assert_eq!(host.primary_manager(), Some("apt"));
    }

    #[test]
    fn set_credentials_serialize_as_stored_marker() {
        let mut host = Host {
            id: "h1".into(),
            name: "web-1".into(),
            hostname: "web-1.example.com".into(),
            port: 22,
            username: "deploy".into(),
            auth_mode: AuthMode::Password,
            enc_password: Some("AAAAbase64token".into()),
            enc_private_key: None,
            enc_key_passphrase: None,
            enc_sudo_password: Some("BBBBbase64token".into()),
            detected_managers: vec![],
            disabled_managers: vec![],
            sudo_available: false,
            reachability: Reachability::Unknown,
            last_seen: None,
            facts: None,
            last_notified_fingerprint: None,
            exclude_from_bulk: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_value(&host).unwrap();
        assert_eq!(json["enc_password"], STORED_MARKER);
        assert_eq!(json["enc_sudo_password"], STORED_MARKER);
        assert!(json["enc_private_key"].is_null());
        // Ciphertext never appears in the serialized form
        assert!(!json.to_string().contains("base64token"));

        host.enc_password = None;
        let json = serde_json::to_value(&host).unwrap();
        assert!(json["enc_password"].is_null());
    }

    #[test]
    fn schedule_round_trips() {
        assert_eq!(
            DeliverySchedule::parse("immediate"),
            DeliverySchedule::Immediate
        );
        assert_eq!(
            DeliverySchedule::parse("0 8 * * *"),
            DeliverySchedule::Cron("0 8 * * *".into())
        );
        assert_eq!(DeliverySchedule::Cron("0 8 * * *".into()).as_str(), "0 8 * * *");
    }

    #[test]
    fn scope_matching() {
        let mut channel = NotificationChannel {
            id: "c1".into(),
            name: "ops".into(),
            provider: "email".into(),
            enabled: true,
            notify_updates: true,
            notify_unreachable: false,
            host_scope: None,
            config: serde_json::json!({}),
            schedule: DeliverySchedule::Immediate,
            pending_events: vec![],
            last_sent_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(channel.covers_host("any"));
        channel.host_scope = Some(vec!["h1".into()]);
        assert!(channel.covers_host("h1"));
        assert!(!channel.covers_host("h2"));
    }
}
