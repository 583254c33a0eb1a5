//! Host registry: CRUD, detection results, reachability and system facts.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::records::{AuthMode, Host, NewHost, Reachability, SystemFacts, STORED_MARKER};
use super::Database;
use crate::vault::CredentialVault;

/// Which encrypted credential column an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    PrivateKey,
    KeyPassphrase,
    SudoPassword,
}

impl CredentialKind {
    fn column(&self) -> &'static str {
        match self {
            CredentialKind::Password => "enc_password",
            CredentialKind::PrivateKey => "enc_private_key",
            CredentialKind::KeyPassphrase => "enc_key_passphrase",
            CredentialKind::SudoPassword => "enc_sudo_password",
        }
    }
}

const CREDENTIAL_COLUMNS: [CredentialKind; 4] = [
    CredentialKind::Password,
    CredentialKind::PrivateKey,
    CredentialKind::KeyPassphrase,
    CredentialKind::SudoPassword,
];

impl Database {
    pub async fn create_host(&self, new: &NewHost, vault: &CredentialVault) -> Result<Host> {
        if new.auth_mode == AuthMode::Key && new.private_key.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("key authentication requires a private key");
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM hosts WHERE hostname = ? AND port = ? AND username = ?",
        )
        .bind(&new.hostname)
        .bind(new.port as i64)
        .bind(&new.username)
        .fetch_one(self.pool())
        .await?;
        if existing > 0 {
            anyhow::bail!(
                "host {}@{}:{} already exists",
                new.username,
                new.hostname,
                new.port
            );
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let encrypt_opt = |value: &Option<String>| -> Result<Option<String>> {
            match value.as_deref().filter(|v| !v.is_empty()) {
                Some(plain) => Ok(Some(vault.encrypt(plain)?)),
                None => Ok(None),
            }
        };

        sqlx::query(
            r#"
            INSERT INTO hosts (
                id, name, hostname, port, username, auth_mode,
                enc_password, enc_private_key, enc_key_passphrase, enc_sudo_password,
                exclude_from_bulk, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.hostname)
        .bind(new.port as i64)
        .bind(&new.username)
        .bind(new.auth_mode.as_str())
        .bind(encrypt_opt(&new.password)?)
        .bind(encrypt_opt(&new.private_key)?)
        .bind(encrypt_opt(&new.key_passphrase)?)
        .bind(encrypt_opt(&new.sudo_password)?)
        .bind(new.exclude_from_bulk)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        info!("Registered host {} ({}@{}:{})", new.name, new.username, new.hostname, new.port);
        self.get_host(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("host {id} vanished after insert"))
    }

    pub async fn get_host(&self, id: &str) -> Result<Option<Host>> {
        let row = sqlx::query("SELECT * FROM hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| host_from_row(&r)).transpose()
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query("SELECT * FROM hosts ORDER BY name, hostname")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(host_from_row).collect()
    }

    /// Update operator-editable host fields. Credentials go through
    /// [`Database::set_host_credential`].
    #[allow(clippy::too_many_arguments)]
    pub async fn update_host_settings(
        &self,
        id: &str,
        name: &str,
        hostname: &str,
        port: u16,
        username: &str,
        auth_mode: AuthMode,
        disabled_managers: &[String],
        exclude_from_bulk: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE hosts SET name = ?, hostname = ?, port = ?, username = ?,
                auth_mode = ?, disabled_managers = ?, exclude_from_bulk = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(hostname)
        .bind(port as i64)
        .bind(username)
        .bind(auth_mode.as_str())
        .bind(serde_json::to_string(disabled_managers)?)
        .bind(exclude_from_bulk)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Apply one credential field from a partial update: `None` = keep,
    /// the `(stored)` marker = keep, empty string = clear, anything else
    /// = encrypt and replace. Mirrors how channel config secrets behave.
    pub async fn apply_host_credential(
        &self,
        id: &str,
        kind: CredentialKind,
        value: Option<&str>,
        vault: &CredentialVault,
    ) -> Result<()> {
        let Some(value) = value else { return Ok(()) };
        if value == STORED_MARKER {
            return Ok(());
        }
        let token = if value.is_empty() {
            None
        } else {
            Some(vault.encrypt(value)?)
        };
        self.set_host_credential(id, kind, token).await
    }

    pub async fn set_host_credential(
        &self,
        id: &str,
        kind: CredentialKind,
        token: Option<String>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE hosts SET {} = ?, updated_at = ? WHERE id = ?",
            kind.column()
        );
        sqlx::query(&sql)
            .bind(token)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Cascades to cached updates and history.
    pub async fn delete_host(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM hosts WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_detection(
        &self,
        id: &str,
        managers: &[String],
        sudo_available: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE hosts SET detected_managers = ?, sudo_available = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(managers)?)
        .bind(sudo_available)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_reachability(&self, id: &str, reachability: Reachability) -> Result<()> {
        let now = Utc::now();
        if reachability == Reachability::Reachable {
            sqlx::query(
                "UPDATE hosts SET reachability = ?, last_seen = ?, updated_at = ? WHERE id = ?",
            )
            .bind(reachability.as_str())
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;
        } else {
            sqlx::query("UPDATE hosts SET reachability = ?, updated_at = ? WHERE id = ?")
                .bind(reachability.as_str())
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Facts write is atomic with marking the host reachable.
    pub async fn set_system_facts(&self, id: &str, facts: &SystemFacts) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE hosts SET
                os_name = ?, kernel = ?, fact_hostname = ?, uptime_seconds = ?,
                arch = ?, cpu_cores = ?, memory_bytes = ?, disk_total_bytes = ?,
                disk_free_bytes = ?, needs_reboot = ?,
                reachability = 'reachable', last_seen = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&facts.os_name)
        .bind(&facts.kernel)
        .bind(&facts.hostname)
        .bind(facts.uptime_seconds)
        .bind(&facts.arch)
        .bind(facts.cpu_cores)
        .bind(facts.memory_bytes)
        .bind(facts.disk_total_bytes)
        .bind(facts.disk_free_bytes)
        .bind(facts.needs_reboot)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_last_notified_fingerprint(&self, id: &str, fingerprint: &str) -> Result<()> {
        sqlx::query(
            "UPDATE hosts SET last_notified_fingerprint = ?, updated_at = ? WHERE id = ?",
        )
        .bind(fingerprint)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn reencrypt_host_credentials(
        &self,
        old_vault: &CredentialVault,
        new_vault: &CredentialVault,
    ) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT id, enc_password, enc_private_key, enc_key_passphrase, enc_sudo_password FROM hosts",
        )
        .fetch_all(self.pool())
        .await?;

        let mut migrated = 0usize;
        for row in rows {
            let id: String = row.try_get("id")?;
            for kind in CREDENTIAL_COLUMNS {
                let token: Option<String> = row.try_get(kind.column())?;
                let Some(token) = token else { continue };
                let plain = old_vault.decrypt(&token)?;
                let reencrypted = new_vault.encrypt(&plain)?;
                self.set_host_credential(&id, kind, Some(reencrypted)).await?;
                migrated += 1;
            }
        }
        Ok(migrated)
    }
}

fn host_from_row(row: &SqliteRow) -> Result<Host> {
    let auth_mode: String = row.try_get("auth_mode")?;
    let reachability: String = row.try_get("reachability")?;
    let detected: String = row.try_get("detected_managers")?;
    let disabled: String = row.try_get("disabled_managers")?;
    let port: i64 = row.try_get("port")?;

    let facts = SystemFacts {
        os_name: row.try_get("os_name")?,
        kernel: row.try_get("kernel")?,
        hostname: row.try_get("fact_hostname")?,
        uptime_seconds: row.try_get("uptime_seconds")?,
        arch: row.try_get("arch")?,
        cpu_cores: row.try_get("cpu_cores")?,
        memory_bytes: row.try_get("memory_bytes")?,
        disk_total_bytes: row.try_get("disk_total_bytes")?,
        disk_free_bytes: row.try_get("disk_free_bytes")?,
        needs_reboot: row.try_get("needs_reboot")?,
    };
    let has_facts = facts.os_name.is_some() || facts.kernel.is_some() || facts.arch.is_some();

    Ok(Host {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        hostname: row.try_get("hostname")?,
        port: port as u16,
        username: row.try_get("username")?,
        auth_mode: AuthMode::parse(&auth_mode),
        enc_password: row.try_get("enc_password")?,
        enc_private_key: row.try_get("enc_private_key")?,
        enc_key_passphrase: row.try_get("enc_key_passphrase")?,
        enc_sudo_password: row.try_get("enc_sudo_password")?,
        detected_managers: serde_json::from_str(&detected).unwrap_or_default(),
        disabled_managers: serde_json::from_str(&disabled).unwrap_or_default(),
        sudo_available: row.try_get("sudo_available")?,
        reachability: Reachability::parse(&reachability),
        last_seen: row.try_get("last_seen")?,
        facts: has_facts.then_some(facts),
        last_notified_fingerprint: row.try_get("last_notified_fingerprint")?,
        exclude_from_bulk: row.try_get("exclude_from_bulk")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
