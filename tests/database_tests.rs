//! Integration tests for the registry, cache and history layers.
//!
//! Each test opens a fresh SQLite database in a temp directory so tests
//! stay isolated and can exercise restart behavior by reopening the file.

use chrono::{Duration, Utc};
use tempfile::TempDir;

use ludash::database::hosts::CredentialKind;
use ludash::database::records::{
    AuthMode, HistoryStatus, HostAction, NewHost, Reachability, SystemFacts, STORED_MARKER,
};
use ludash::database::Database;
use ludash::managers::ParsedUpdate;
use ludash::vault::CredentialVault;

struct TestDb {
    _dir: TempDir,
    path: String,
    db: Database,
}

async fn test_db() -> TestDb {
    let dir = TempDir::new().expect("tempdir");
    let path = dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .into_owned();
    let db = Database::new(&path).await.expect("database init");
    TestDb {
        _dir: dir,
        path,
        db,
    }
}

fn test_vault() -> CredentialVault {
    CredentialVault::legacy("integration-test-key")
}

fn sample_host(name: &str, hostname: &str) -> NewHost {
    NewHost {
        name: name.to_string(),
        hostname: hostname.to_string(),
        port: 22,
        username: "deploy".to_string(),
        auth_mode: AuthMode::Password,
        password: Some("hunter2".to_string()),
        private_key: None,
        key_passphrase: None,
        sudo_password: Some("hunter2".to_string()),
        exclude_from_bulk: false,
    }
}

fn parsed(manager: &str, package: &str, security: bool) -> ParsedUpdate {
    ParsedUpdate {
        package: package.to_string(),
        current_version: Some("1.0".to_string()),
        new_version: Some("1.1".to_string()),
        architecture: Some("amd64".to_string()),
        repository: Some(if security { "jammy-security" } else { "jammy-updates" }.to_string()),
        is_security: security,
        manager: manager.to_string(),
    }
}

#[tokio::test]
async fn host_crud_and_credential_encryption() {
    let t = test_db().await;
    let vault = test_vault();

    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    assert_eq!(host.name, "web-1");
    assert_eq!(host.reachability, Reachability::Unknown);
    // Stored encrypted, not in the clear
    let token = host.enc_password.clone().unwrap();
    assert_ne!(token, "hunter2");
    assert_eq!(vault.decrypt(&token).unwrap(), "hunter2");

    let fetched = t.db.get_host(&host.id).await.unwrap().unwrap();
    assert_eq!(fetched.hostname, "web-1.example.com");

    assert!(t.db.delete_host(&host.id).await.unwrap());
    assert!(t.db.get_host(&host.id).await.unwrap().is_none());
    assert!(!t.db.delete_host(&host.id).await.unwrap());
}

#[tokio::test]
async fn host_credentials_are_masked_and_preserved() {
    let t = test_db().await;
    let vault = test_vault();

    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    // Read side is masked: set credentials surface as the marker, unset
    // ones as null, and no ciphertext leaks into the serialized form.
    let json = serde_json::to_value(&host).unwrap();
    assert_eq!(json["enc_password"], STORED_MARKER);
    assert_eq!(json["enc_sudo_password"], STORED_MARKER);
    assert!(json["enc_private_key"].is_null());
    let original_token = host.enc_password.clone().unwrap();
    assert!(!json.to_string().contains(&original_token));

    // Partial update sending the marker back keeps the stored token
    t.db.apply_host_credential(
        &host.id,
        CredentialKind::Password,
        Some(STORED_MARKER),
        &vault,
    )
    .await
    .unwrap();
    let after = t.db.get_host(&host.id).await.unwrap().unwrap();
    assert_eq!(after.enc_password.as_deref(), Some(original_token.as_str()));

    // Omitted field is untouched, a new value replaces, empty clears
    t.db.apply_host_credential(&host.id, CredentialKind::Password, None, &vault)
        .await
        .unwrap();
    let after = t.db.get_host(&host.id).await.unwrap().unwrap();
    assert_eq!(after.enc_password.as_deref(), Some(original_token.as_str()));

    t.db.apply_host_credential(&host.id, CredentialKind::Password, Some("rotated"), &vault)
        .await
        .unwrap();
    let after = t.db.get_host(&host.id).await.unwrap().unwrap();
    let rotated = after.enc_password.unwrap();
    assert_ne!(rotated, original_token);
    assert_eq!(vault.decrypt(&rotated).unwrap(), "rotated");

    t.db.apply_host_credential(&host.id, CredentialKind::SudoPassword, Some(""), &vault)
        .await
        .unwrap();
    let after = t.db.get_host(&host.id).await.unwrap().unwrap();
    assert!(after.enc_sudo_password.is_none());
}

#[tokio::test]
async fn duplicate_endpoint_is_rejected() {
    let t = test_db().await;
    let vault = test_vault();

    t.db.create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();
    let duplicate = t
        .db
        .create_host(&sample_host("other-name", "web-1.example.com"), &vault)
        .await;
    assert!(duplicate.is_err());
}

#[tokio::test]
async fn key_auth_requires_private_key() {
    let t = test_db().await;
    let vault = test_vault();
    let mut new = sample_host("web-1", "web-1.example.com");
    new.auth_mode = AuthMode::Key;
    new.private_key = None;
    assert!(t.db.create_host(&new, &vault).await.is_err());
}

#[tokio::test]
async fn cache_replacement_is_total() {
    let t = test_db().await;
    let vault = test_vault();
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    t.db.replace_cached_updates(
        &host.id,
        &[parsed("apt", "curl", false), parsed("apt", "openssl", true)],
    )
    .await
    .unwrap();
    assert_eq!(t.db.cached_update_count(&host.id).await.unwrap(), 2);

    // Replacement removes prior rows entirely
    t.db.replace_cached_updates(&host.id, &[parsed("apt", "vim", false)])
        .await
        .unwrap();
    let updates = t.db.cached_updates(&host.id).await.unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].package, "vim");

    t.db.replace_cached_updates(&host.id, &[]).await.unwrap();
    assert_eq!(t.db.cached_update_count(&host.id).await.unwrap(), 0);
}

#[tokio::test]
async fn cached_managers_are_distinct() {
    let t = test_db().await;
    let vault = test_vault();
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    t.db.replace_cached_updates(
        &host.id,
        &[
            parsed("apt", "curl", false),
            parsed("apt", "vim", false),
            parsed("flatpak", "org.videolan.VLC", false),
        ],
    )
    .await
    .unwrap();

    let managers = t.db.cached_managers(&host.id).await.unwrap();
    assert_eq!(managers, vec!["apt", "flatpak"]);
}

#[tokio::test]
async fn deleting_host_cascades() {
    let t = test_db().await;
    let vault = test_vault();
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    t.db.replace_cached_updates(&host.id, &[parsed("apt", "curl", false)])
        .await
        .unwrap();
    t.db.record_history(
        &host.id,
        HostAction::Check,
        "apt",
        HistoryStatus::Success,
        "apt update check",
        "",
        None,
        &["curl".to_string()],
    )
    .await
    .unwrap();

    t.db.delete_host(&host.id).await.unwrap();
    assert_eq!(t.db.cached_update_count(&host.id).await.unwrap(), 0);
    assert!(t.db.host_history(&host.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_hosts_include_never_checked_and_old_caches() {
    let t = test_db().await;
    let vault = test_vault();

    let never = t
        .db
        .create_host(&sample_host("never", "never.example.com"), &vault)
        .await
        .unwrap();
    let fresh = t
        .db
        .create_host(&sample_host("fresh", "fresh.example.com"), &vault)
        .await
        .unwrap();
    let old = t
        .db
        .create_host(&sample_host("old", "old.example.com"), &vault)
        .await
        .unwrap();

    t.db.replace_cached_updates(&fresh.id, &[parsed("apt", "curl", false)])
        .await
        .unwrap();
    t.db.replace_cached_updates(&old.id, &[parsed("apt", "curl", false)])
        .await
        .unwrap();

    // Age the old host's cache past the horizon
    let aged = Utc::now() - Duration::hours(24);
    sqlx::query("UPDATE update_cache SET cached_at = ? WHERE host_id = ?")
        .bind(aged)
        .bind(&old.id)
        .execute(t.db.pool())
        .await
        .unwrap();

    let stale = t.db.stale_host_ids(12).await.unwrap();
    assert!(stale.contains(&never.id));
    assert!(stale.contains(&old.id));
    assert!(!stale.contains(&fresh.id));
}

#[tokio::test]
async fn history_rows_reach_terminal_status() {
    let t = test_db().await;
    let vault = test_vault();
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    let id = t
        .db
        .start_history(&host.id, HostAction::UpgradeAll, "apt", "sudo apt-get -y upgrade")
        .await
        .unwrap();
    t.db.finish_history(&id, HistoryStatus::Success, "done", None, &[])
        .await
        .unwrap();

    let history = t.db.host_history(&host.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HistoryStatus::Success);
    assert!(history[0].completed_at.is_some());
}

#[tokio::test]
async fn restart_fails_interrupted_history_rows() {
    let t = test_db().await;
    let vault = test_vault();
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();

    t.db.start_history(&host.id, HostAction::UpgradeAll, "apt", "sudo apt-get -y upgrade")
        .await
        .unwrap();
    let host_id = host.id.clone();
    let TestDb { _dir, path, db } = t;
    drop(db);

    // Reopen the same file; startup recovery rewrites the stuck row.
    let reopened = Database::new(&path).await.unwrap();
    let history = reopened.host_history(&host_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HistoryStatus::Failed);
    assert_eq!(history[0].error.as_deref(), Some("server restarted"));
    assert!(history[0].completed_at.is_some());
}

#[tokio::test]
async fn system_facts_write_marks_reachable() {
    let t = test_db().await;
    let vault = test_vault();
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &vault)
        .await
        .unwrap();
    assert_eq!(host.reachability, Reachability::Unknown);

    let facts = SystemFacts {
        os_name: Some("Ubuntu 22.04.3 LTS".to_string()),
        kernel: Some("5.15.0-91-generic".to_string()),
        hostname: Some("web-1".to_string()),
        uptime_seconds: Some(1234),
        arch: Some("x86_64".to_string()),
        cpu_cores: Some(8),
        memory_bytes: Some(16 * 1024 * 1024 * 1024),
        disk_total_bytes: Some(100_000_000_000),
        disk_free_bytes: Some(60_000_000_000),
        needs_reboot: true,
    };
    t.db.set_system_facts(&host.id, &facts).await.unwrap();

    let fetched = t.db.get_host(&host.id).await.unwrap().unwrap();
    assert_eq!(fetched.reachability, Reachability::Reachable);
    assert!(fetched.last_seen.is_some());
    let stored = fetched.facts.unwrap();
    assert_eq!(stored.os_name.as_deref(), Some("Ubuntu 22.04.3 LTS"));
    assert!(stored.needs_reboot);
}

#[tokio::test]
async fn vault_migration_reencrypts_credentials() {
    let t = test_db().await;
    let old_vault = CredentialVault::legacy("integration-test-key");
    let host = t
        .db
        .create_host(&sample_host("web-1", "web-1.example.com"), &old_vault)
        .await
        .unwrap();

    let new_vault = CredentialVault::legacy("another-key-entirely");
    let migrated = t.db.reencrypt_all(&old_vault, &new_vault).await.unwrap();
    assert_eq!(migrated, 2); // password + sudo password

    let fetched = t.db.get_host(&host.id).await.unwrap().unwrap();
    let token = fetched.enc_password.unwrap();
    assert!(old_vault.decrypt(&token).is_err());
    assert_eq!(new_vault.decrypt(&token).unwrap(), "hunter2");
}
