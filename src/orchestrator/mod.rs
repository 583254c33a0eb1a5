//! Update orchestrator: per-host serialized check/upgrade/reboot workflows.
//!
//! Every operation takes the host's FIFO lock, publishes a `reset` on the
//! live bus, records an in-memory `ActiveOperation`, opens one SSH session
//! and runs its workflow. The lock guard and the operation entry both
//! release on drop, so no failure path can leave a host wedged.
//!
//! Upgrades run through the persistent-command engine: losing the monitor
//! triggers a reconnection loop, and a reboot that wiped the job's temp
//! files is resolved by re-checking and comparing pending-update counts.

pub mod facts;
pub mod host_locks;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{BusMessage, LiveBus};
use crate::constants::{reconnect, timeouts};
use crate::database::records::{HistoryStatus, Host, HostAction, Reachability};
use crate::database::Database;
use crate::errors::CoreError;
use crate::managers::{
    self, manager_by_name, wrap_for_host, PackageManager, ParsedUpdate,
};
use crate::sanitize::{display_command, sanitize};
use crate::ssh::persistent::{self, PersistentHandle, PersistentOutcome};
use crate::ssh::{OutputFrame, OutputSink, SshManager, SshSession};
use crate::vault::CredentialVault;

use self::host_locks::HostLocks;

/// In-memory description of the operation currently holding a host's lock.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveOperation {
    pub action: HostAction,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub persistent: Option<PersistentHandle>,
}

/// Result of a completed check, consumed by the scheduler and web layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckSummary {
    pub host_id: String,
    pub update_count: usize,
    pub security_count: usize,
}

pub struct Orchestrator {
    database: Arc<Database>,
    ssh: Arc<SshManager>,
    vault: Arc<CredentialVault>,
    bus: Arc<LiveBus>,
    locks: HostLocks,
    active: Arc<StdMutex<HashMap<String, ActiveOperation>>>,
    check_timeout: Duration,
}

/// Clears the host's ActiveOperation on drop, panics included.
struct OpGuard {
    active: Arc<StdMutex<HashMap<String, ActiveOperation>>>,
    host_id: String,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.host_id);
        }
    }
}

/// How one manager's upgrade run ended.
enum UpgradeStep {
    /// Process observed to completion (directly or after resuming).
    Exited { code: i32, output: String },
    /// Files gone after reboot; result inferred from re-checked counts.
    /// `refreshed` says whether the cache was successfully re-checked.
    Inferred { success: bool, refreshed: bool },
    /// Reconnection window exhausted.
    Lost,
}

impl Orchestrator {
    pub fn new(
        database: Arc<Database>,
        ssh: Arc<SshManager>,
        vault: Arc<CredentialVault>,
        bus: Arc<LiveBus>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            database,
            ssh,
            vault,
            bus,
            locks: HostLocks::new(),
            active: Arc::new(StdMutex::new(HashMap::new())),
            check_timeout,
        }
    }

    pub fn active_operation(&self, host_id: &str) -> Option<ActiveOperation> {
        self.active.lock().ok()?.get(host_id).cloned()
    }

    /// Forget per-host in-memory state after a host is deleted.
    pub async fn forget_host(&self, host_id: &str) {
        self.locks.remove(host_id).await;
        self.bus.remove_stream(host_id).await;
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub async fn check(&self, host_id: &str) -> Result<CheckSummary> {
        let _lock = self.locks.acquire(host_id).await;
        let host = self.load_host(host_id).await?;
        let _op = self.begin(host_id, HostAction::Check).await;

        let result = self.run_check(&host, false).await;
        self.publish_done(host_id, result.is_ok()).await;
        result
    }

    pub async fn upgrade_all(&self, host_id: &str) -> Result<()> {
        self.upgrade(host_id, HostAction::UpgradeAll, None).await
    }

    pub async fn full_upgrade_all(&self, host_id: &str) -> Result<()> {
        self.upgrade(host_id, HostAction::FullUpgradeAll, None).await
    }

    pub async fn upgrade_package(&self, host_id: &str, package: &str) -> Result<()> {
        managers::validate_package_name(package)?;
        self.upgrade(host_id, HostAction::UpgradePackage, Some(package))
            .await
    }

    pub async fn reboot(&self, host_id: &str) -> Result<()> {
        let _lock = self.locks.acquire(host_id).await;
        let host = self.load_host(host_id).await?;
        let _op = self.begin(host_id, HostAction::Reboot).await;

        let result = self.run_reboot(&host).await;
        self.publish_done(host_id, result.is_ok()).await;
        result
    }

    /// Check every registered host; one failure does not stop the rest.
    pub async fn check_all(&self) -> Result<Vec<CheckSummary>> {
        let hosts = self.database.list_hosts().await?;
        let checks = hosts.iter().map(|host| self.check(&host.id));
        let results = futures::future::join_all(checks).await;

        let mut summaries = Vec::new();
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("Check failed for {}: {e:#}", host.name),
            }
        }
        Ok(summaries)
    }

    /// Upgrade every host not excluded from bulk operations.
    pub async fn upgrade_all_hosts(&self) -> Result<()> {
        let hosts = self.database.list_hosts().await?;
        let eligible: Vec<&Host> = hosts.iter().filter(|h| !h.exclude_from_bulk).collect();
        info!(
            "Bulk upgrade across {} hosts ({} excluded)",
            eligible.len(),
            hosts.len() - eligible.len()
        );
        let upgrades = eligible.iter().map(|host| self.upgrade_all(&host.id));
        for (host, result) in eligible.iter().zip(futures::future::join_all(upgrades).await) {
            if let Err(e) = result {
                warn!("Bulk upgrade failed for {}: {e:#}", host.name);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Check workflow
    // ------------------------------------------------------------------

    async fn run_check(&self, host: &Host, silent: bool) -> Result<CheckSummary> {
        let session = match self.ssh.connect(host).await {
            Ok(session) => session,
            Err(e) => {
                self.database
                    .set_reachability(&host.id, Reachability::Unreachable)
                    .await?;
                if !silent {
                    self.database
                        .record_history(
                            &host.id,
                            HostAction::Check,
                            "",
                            HistoryStatus::Failed,
                            "",
                            "",
                            Some(&sanitize(&e.to_string())),
                            &[],
                        )
                        .await?;
                    self.bus
                        .publish(
                            &host.id,
                            BusMessage::Error {
                                message: sanitize(&e.to_string()),
                            },
                        )
                        .await;
                }
                return Err(e.into());
            }
        };

        let result = self.run_check_on_session(host, &session, silent).await;
        session.disconnect().await;
        result
    }

    async fn run_check_on_session(
        &self,
        host: &Host,
        session: &SshSession,
        silent: bool,
    ) -> Result<CheckSummary> {
        // System facts; the write also marks the host reachable.
        let probe = self
            .ssh
            .run(session, &facts::facts_probe_command(), self.check_timeout, None, None)
            .await?;
        let system_facts = facts::parse_facts(&probe.stdout);
        self.database.set_system_facts(&host.id, &system_facts).await?;

        // Detect managers on first contact.
        let (active_managers, sudo_available) = if host.detected_managers.is_empty() {
            let probe = self
                .ssh
                .run(
                    session,
                    &managers::detection_probe_command(),
                    self.check_timeout,
                    None,
                    None,
                )
                .await?;
            let detection = managers::parse_detection_output(&probe.stdout);
            info!(
                "Detected managers on {}: {:?} (sudo: {})",
                host.name, detection.managers, detection.sudo_available
            );
            self.database
                .set_detection(&host.id, &detection.managers, detection.sudo_available)
                .await?;
            let active = detection
                .managers
                .iter()
                .filter(|m| !host.disabled_managers.contains(m))
                .cloned()
                .collect::<Vec<_>>();
            (active, detection.sudo_available)
        } else {
            (host.active_managers(), host.sudo_available)
        };

        let sudo_password = self.sudo_password(host)?;
        let use_sudo = sudo_available && host.username != "root";

        let mut all_updates: Vec<ParsedUpdate> = Vec::new();
        for name in &active_managers {
            let Some(adapter) = manager_by_name(name) else {
                warn!("Unknown manager {name:?} recorded for {}", host.name);
                continue;
            };

            let updates = self
                .check_one_manager(
                    host,
                    session,
                    adapter.as_ref(),
                    use_sudo,
                    sudo_password.as_deref(),
                    silent,
                )
                .await?;
            all_updates.extend(updates);
        }

        self.database
            .replace_cached_updates(&host.id, &all_updates)
            .await?;

        let security_count = all_updates.iter().filter(|u| u.is_security).count();
        info!(
            "Check finished for {}: {} updates ({} security)",
            host.name,
            all_updates.len(),
            security_count
        );

        Ok(CheckSummary {
            host_id: host.id.clone(),
            update_count: all_updates.len(),
            security_count,
        })
    }

    /// Run one manager's check commands. Transport errors propagate (the
    /// host is gone); command or parse trouble downgrades to "no updates"
    /// so the remaining managers still run.
    async fn check_one_manager(
        &self,
        host: &Host,
        session: &SshSession,
        adapter: &dyn PackageManager,
        use_sudo: bool,
        sudo_password: Option<&str>,
        silent: bool,
    ) -> Result<Vec<ParsedUpdate>> {
        let commands = adapter.check_commands();
        let labels = adapter.step_labels();

        if !silent {
            self.bus
                .publish(
                    &host.id,
                    BusMessage::Started {
                        command: format!("{} update check", adapter.name()),
                        manager: adapter.name().to_string(),
                    },
                )
                .await;
        }

        let mut last = crate::ssh::CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit: 0,
        };
        let mut collected_output = String::new();

        for (index, command) in commands.iter().enumerate() {
            if !silent {
                if let Some(label) = labels.get(index) {
                    self.bus
                        .publish(
                            &host.id,
                            BusMessage::Phase {
                                label: label.to_string(),
                            },
                        )
                        .await;
                }
            }

            let wrapped = wrap_for_host(command, use_sudo);
            let password = use_sudo.then_some(sudo_password).flatten();

            let (sink, collector) = self.spawn_bus_forwarder(&host.id, !silent);
            let result = self
                .ssh
                .run(session, &wrapped, self.check_timeout, password, Some(&sink))
                .await;
            drop(sink);
            let streamed = collector.await.unwrap_or_default();
            collected_output.push_str(&streamed);

            last = result?;
        }

        let updates = match adapter.parse_updates(&last.stdout, &last.stderr, last.exit) {
            Ok(updates) => updates,
            Err(e) => {
                warn!(
                    "Parse failure for {} on {}: {e}; treating as no updates",
                    adapter.name(),
                    host.name
                );
                if !silent {
                    self.bus
                        .publish(
                            &host.id,
                            BusMessage::Warning {
                                message: format!("{} output could not be parsed", adapter.name()),
                            },
                        )
                        .await;
                }
                Vec::new()
            }
        };

        if !silent {
            let packages: Vec<String> = updates.iter().map(|u| u.package.clone()).collect();
            self.database
                .record_history(
                    &host.id,
                    HostAction::Check,
                    adapter.name(),
                    HistoryStatus::Success,
                    &format!("{} update check", adapter.name()),
                    &sanitize(&collected_output),
                    None,
                    &packages,
                )
                .await?;
        }

        Ok(updates)
    }

    // ------------------------------------------------------------------
    // Upgrade workflows
    // ------------------------------------------------------------------

    async fn upgrade(
        &self,
        host_id: &str,
        action: HostAction,
        package: Option<&str>,
    ) -> Result<()> {
        let _lock = self.locks.acquire(host_id).await;
        let host = self.load_host(host_id).await?;
        let _op = self.begin(host_id, action).await;

        let result = self.run_upgrade(&host, action, package).await;
        self.publish_done(host_id, result.is_ok()).await;
        result
    }

    async fn run_upgrade(
        &self,
        host: &Host,
        action: HostAction,
        package: Option<&str>,
    ) -> Result<()> {
        let pre_count = self.database.cached_update_count(&host.id).await?;
        let manager_names = self.managers_for_upgrade(host, package).await?;
        if manager_names.is_empty() {
            anyhow::bail!("no package manager known for {}", host.name);
        }

        let timeout = match action {
            HostAction::UpgradePackage => Duration::from_secs(timeouts::SINGLE_UPGRADE_SECONDS),
            _ => Duration::from_secs(timeouts::BULK_UPGRADE_SECONDS),
        };

        let sudo_password = self.sudo_password(host)?;
        let use_sudo = host.sudo_available && host.username != "root";

        let session = match self.ssh.connect(host).await {
            Ok(session) => session,
            Err(e) => {
                self.database
                    .set_reachability(&host.id, Reachability::Unreachable)
                    .await?;
                self.database
                    .record_history(
                        &host.id,
                        action,
                        "",
                        HistoryStatus::Failed,
                        "",
                        "",
                        Some(&sanitize(&e.to_string())),
                        &[],
                    )
                    .await?;
                self.bus
                    .publish(
                        &host.id,
                        BusMessage::Error {
                            message: sanitize(&e.to_string()),
                        },
                    )
                    .await;
                return Err(e.into());
            }
        };

        let mut session = Some(session);
        let mut cache_refreshed = false;
        let mut overall: Result<()> = Ok(());

        for name in &manager_names {
            let Some(adapter) = manager_by_name(name) else {
                continue;
            };
            let Some(command) = upgrade_command(adapter.as_ref(), action, package)? else {
                continue;
            };
            let wrapped = wrap_for_host(&command, use_sudo);
            let shown = display_command(&wrapped);

            let history_id = self
                .database
                .start_history(&host.id, action, adapter.name(), &shown)
                .await?;
            self.bus
                .publish(
                    &host.id,
                    BusMessage::Started {
                        command: shown.clone(),
                        manager: adapter.name().to_string(),
                    },
                )
                .await;

            let Some(current) = session.as_ref() else {
                // Session consumed by a previous reconnection; remaining
                // managers wait for a new operator action.
                self.database
                    .finish_history(
                        &history_id,
                        HistoryStatus::Failed,
                        "",
                        Some("skipped after reconnection"),
                        &[],
                    )
                    .await?;
                break;
            };

            let step = self
                .run_persistent_step(
                    host,
                    current,
                    &wrapped,
                    use_sudo.then_some(sudo_password.as_deref()).flatten(),
                    timeout,
                    pre_count,
                )
                .await;

            match step {
                Ok(UpgradeStep::Exited { code: 0, output }) => {
                    self.database
                        .finish_history(
                            &history_id,
                            HistoryStatus::Success,
                            &sanitize(&output),
                            None,
                            &[],
                        )
                        .await?;
                }
                Ok(UpgradeStep::Exited { code, output }) => {
                    let message = format!("{} exited with code {code}", adapter.name());
                    self.database
                        .finish_history(
                            &history_id,
                            HistoryStatus::Failed,
                            &sanitize(&output),
                            Some(&message),
                            &[],
                        )
                        .await?;
                    self.bus
                        .publish(&host.id, BusMessage::Error { message: message.clone() })
                        .await;
                    overall = Err(CoreError::RemoteExit(code).into());
                    break;
                }
                Ok(UpgradeStep::Inferred { success, refreshed }) => {
                    cache_refreshed = refreshed;
                    session = None;
                    if success {
                        self.database
                            .finish_history(
                                &history_id,
                                HistoryStatus::Warning,
                                "",
                                Some("host rebooted during upgrade; fewer updates pending afterwards"),
                                &[],
                            )
                            .await?;
                        self.bus
                            .publish(
                                &host.id,
                                BusMessage::Warning {
                                    message: "host rebooted during upgrade; result inferred from update counts".into(),
                                },
                            )
                            .await;
                    } else {
                        let message = "host rebooted during upgrade and pending updates did not decrease".to_string();
                        self.database
                            .finish_history(
                                &history_id,
                                HistoryStatus::Failed,
                                "",
                                Some(&message),
                                &[],
                            )
                            .await?;
                        self.bus
                            .publish(&host.id, BusMessage::Error { message })
                            .await;
                        overall = Err(CoreError::FilesGone.into());
                    }
                    break;
                }
                Ok(UpgradeStep::Lost) => {
                    session = None;
                    let message = "lost contact during upgrade and could not reconnect".to_string();
                    self.database
                        .finish_history(&history_id, HistoryStatus::Failed, "", Some(&message), &[])
                        .await?;
                    self.bus
                        .publish(&host.id, BusMessage::Error { message })
                        .await;
                    overall = Err(CoreError::MonitoringLost.into());
                    break;
                }
                Err(e) => {
                    self.database
                        .finish_history(
                            &history_id,
                            HistoryStatus::Failed,
                            "",
                            Some(&sanitize(&e.to_string())),
                            &[],
                        )
                        .await?;
                    self.bus
                        .publish(
                            &host.id,
                            BusMessage::Error {
                                message: sanitize(&e.to_string()),
                            },
                        )
                        .await;
                    overall = Err(e);
                    break;
                }
            }
        }

        if let Some(session) = session.take() {
            session.disconnect().await;
        }

        // Refresh the cache so the UI reflects the new state, unless the
        // files-gone inference already did.
        if !cache_refreshed {
            if let Err(e) = self.run_check(host, true).await {
                warn!("Post-upgrade refresh check failed for {}: {e:#}", host.name);
            }
        }

        overall
    }

    /// Launch one upgrade command detached and see it through to an
    /// outcome, reconnecting if monitoring drops.
    async fn run_persistent_step(
        &self,
        host: &Host,
        session: &SshSession,
        command: &str,
        sudo_password: Option<&str>,
        timeout: Duration,
        pre_count: usize,
    ) -> Result<UpgradeStep> {
        let handle = persistent::launch(&self.ssh, session, command, sudo_password).await?;
        self.set_persistent_handle(&host.id, Some(handle.clone()));

        let (sink, collector) = self.spawn_bus_forwarder(&host.id, true);
        let outcome = persistent::monitor(&self.ssh, session, &handle, timeout, Some(&sink)).await;
        drop(sink);
        let output = collector.await.unwrap_or_default();
        self.set_persistent_handle(&host.id, None);

        match outcome? {
            PersistentOutcome::Exited(code) => Ok(UpgradeStep::Exited { code, output }),
            PersistentOutcome::FilesGone => self.infer_after_reboot(host, pre_count).await,
            PersistentOutcome::MonitoringLost => {
                self.bus
                    .publish(
                        &host.id,
                        BusMessage::Warning {
                            message: "lost contact with host; trying to reconnect".into(),
                        },
                    )
                    .await;
                self.reconnect_and_resume(host, &handle, timeout, pre_count)
                    .await
            }
        }
    }

    /// Reconnect every 15 s for up to 5 min and resume the detached job.
    async fn reconnect_and_resume(
        &self,
        host: &Host,
        handle: &PersistentHandle,
        timeout: Duration,
        pre_count: usize,
    ) -> Result<UpgradeStep> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(reconnect::WINDOW_SECONDS);

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(reconnect::RETRY_INTERVAL_SECONDS)).await;

            let session = match self.ssh.connect(host).await {
                Ok(session) => session,
                Err(e) => {
                    info!("Reconnect attempt to {} failed: {e}", host.name);
                    continue;
                }
            };

            let (sink, collector) = self.spawn_bus_forwarder(&host.id, true);
            let resumed =
                persistent::resume(&self.ssh, &session, handle, timeout, Some(&sink)).await;
            drop(sink);
            let output = collector.await.unwrap_or_default();
            session.disconnect().await;

            match resumed {
                Ok(PersistentOutcome::Exited(code)) => {
                    return Ok(UpgradeStep::Exited { code, output });
                }
                Ok(PersistentOutcome::FilesGone) => {
                    return self.infer_after_reboot(host, pre_count).await;
                }
                Ok(PersistentOutcome::MonitoringLost) => continue,
                Err(e) => {
                    info!("Resume on {} failed: {e}; retrying", host.name);
                    continue;
                }
            }
        }

        error!(
            "Could not reconnect to {} within {}s",
            host.name,
            reconnect::WINDOW_SECONDS
        );
        Ok(UpgradeStep::Lost)
    }

    /// The job's files are gone, almost certainly a reboot. Re-check (with
    /// retries while the host is still coming up) and infer the result
    /// from the pending-update count.
    async fn infer_after_reboot(&self, host: &Host, pre_count: usize) -> Result<UpgradeStep> {
        for attempt in 1..=reconnect::POST_CHECK_ATTEMPTS {
            match self.run_check(host, true).await {
                Ok(summary) => {
                    let success = summary.update_count < pre_count;
                    info!(
                        "Post-reboot inference for {}: {} pending before, {} after",
                        host.name, pre_count, summary.update_count
                    );
                    return Ok(UpgradeStep::Inferred {
                        success,
                        refreshed: true,
                    });
                }
                Err(e) => {
                    info!(
                        "Post-reboot check {}/{} for {} failed: {e:#}",
                        attempt,
                        reconnect::POST_CHECK_ATTEMPTS,
                        host.name
                    );
                    tokio::time::sleep(Duration::from_secs(
                        reconnect::POST_CHECK_INTERVAL_SECONDS,
                    ))
                    .await;
                }
            }
        }
        Ok(UpgradeStep::Inferred {
            success: false,
            refreshed: false,
        })
    }

    // ------------------------------------------------------------------
    // Reboot workflow
    // ------------------------------------------------------------------

    async fn run_reboot(&self, host: &Host) -> Result<()> {
        let sudo_password = self.sudo_password(host)?;
        let use_sudo = host.sudo_available && host.username != "root";

        let session = match self.ssh.connect(host).await {
            Ok(session) => session,
            Err(e) => {
                self.database
                    .record_history(
                        &host.id,
                        HostAction::Reboot,
                        "",
                        HistoryStatus::Failed,
                        "reboot",
                        "",
                        Some(&sanitize(&e.to_string())),
                        &[],
                    )
                    .await?;
                return Err(e.into());
            }
        };

        let command = wrap_for_host("reboot", use_sudo);
        let password = use_sudo.then_some(sudo_password.as_deref()).flatten();
        let outcome = self
            .ssh
            .run(
                &session,
                &command,
                Duration::from_secs(timeouts::REBOOT_SECONDS),
                password,
                None,
            )
            .await;
        session.disconnect().await;

        // A dying connection is the expected shape of a successful reboot.
        match outcome {
            Ok(_) => {}
            Err(ref e) if e.is_connection_loss() => {}
            Err(e) => {
                self.database
                    .record_history(
                        &host.id,
                        HostAction::Reboot,
                        "",
                        HistoryStatus::Failed,
                        "reboot",
                        "",
                        Some(&sanitize(&e.to_string())),
                        &[],
                    )
                    .await?;
                return Err(e.into());
            }
        }

        self.database
            .set_reachability(&host.id, Reachability::Unreachable)
            .await?;
        self.database
            .record_history(
                &host.id,
                HostAction::Reboot,
                "",
                HistoryStatus::Success,
                "reboot",
                "",
                None,
                &[],
            )
            .await?;
        info!("Reboot issued for {}", host.name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    async fn load_host(&self, host_id: &str) -> Result<Host> {
        self.database
            .get_host(host_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("host {host_id}")).into())
    }

    async fn begin(&self, host_id: &str, action: HostAction) -> OpGuard {
        self.bus.publish(host_id, BusMessage::Reset).await;
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                host_id.to_string(),
                ActiveOperation {
                    action,
                    started_at: Utc::now(),
                    persistent: None,
                },
            );
        }
        OpGuard {
            active: self.active.clone(),
            host_id: host_id.to_string(),
        }
    }

    async fn publish_done(&self, host_id: &str, success: bool) {
        self.bus
            .publish(host_id, BusMessage::Done { success })
            .await;
    }

    fn set_persistent_handle(&self, host_id: &str, handle: Option<PersistentHandle>) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(op) = active.get_mut(host_id) {
                op.persistent = handle;
            }
        }
    }

    fn sudo_password(&self, host: &Host) -> Result<Option<String>> {
        match host.enc_sudo_password.as_deref() {
            Some(token) => Ok(Some(self.vault.decrypt(token)?)),
            None => Ok(None),
        }
    }

    /// Managers to upgrade: the ones with cached updates, else the primary.
    async fn managers_for_upgrade(
        &self,
        host: &Host,
        package: Option<&str>,
    ) -> Result<Vec<String>> {
        if let Some(package) = package {
            let cached = self.database.cached_updates(&host.id).await?;
            if let Some(update) = cached.iter().find(|u| u.package == package) {
                return Ok(vec![update.manager.clone()]);
            }
            return Ok(host.primary_manager().map(str::to_string).into_iter().collect());
        }

        let cached = self.database.cached_managers(&host.id).await?;
        let active = host.active_managers();
        let from_cache: Vec<String> = cached
            .into_iter()
            .filter(|m| active.contains(m))
            .collect();
        if !from_cache.is_empty() {
            return Ok(from_cache);
        }
        Ok(host.primary_manager().map(str::to_string).into_iter().collect())
    }

    /// Forward output frames onto the live bus (when live) while
    /// accumulating them for the history row.
    fn spawn_bus_forwarder(
        &self,
        host_id: &str,
        live: bool,
    ) -> (OutputSink, tokio::task::JoinHandle<String>) {
        let (tx, mut rx) = mpsc::channel::<OutputFrame>(64);
        let bus = self.bus.clone();
        let host_id = host_id.to_string();
        let collector = tokio::spawn(async move {
            let mut collected = String::new();
            while let Some(frame) = rx.recv().await {
                collected.push_str(&frame.data);
                if live {
                    bus.publish(
                        &host_id,
                        BusMessage::Output {
                            data: frame.data,
                            stream: frame.stream,
                        },
                    )
                    .await;
                }
            }
            collected
        });
        (tx, collector)
    }
}

fn upgrade_command(
    adapter: &dyn PackageManager,
    action: HostAction,
    package: Option<&str>,
) -> Result<Option<String>> {
    Ok(match action {
        HostAction::UpgradeAll => Some(adapter.upgrade_all_command()),
        // Managers without a distinct full upgrade fall back to the
        // ordinary one.
        HostAction::FullUpgradeAll => Some(
            adapter
                .full_upgrade_all_command()
                .unwrap_or_else(|| adapter.upgrade_all_command()),
        ),
        HostAction::UpgradePackage => {
            let package =
                package.ok_or_else(|| CoreError::Validation("package name required".into()))?;
            Some(adapter.upgrade_package_command(package)?)
        }
        HostAction::Check | HostAction::Reboot => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::apt::Apt;
    use crate::managers::dnf::{Dnf, Yum};

    #[test]
    fn upgrade_command_selection() {
        let cmd = upgrade_command(&Apt, HostAction::UpgradeAll, None)
            .unwrap()
            .unwrap();
        assert!(cmd.contains("apt-get -y upgrade"));

        let cmd = upgrade_command(&Dnf, HostAction::FullUpgradeAll, None)
            .unwrap()
            .unwrap();
        assert!(cmd.contains("distro-sync"));

        // yum has no full upgrade; falls back to the plain one
        let cmd = upgrade_command(&Yum, HostAction::FullUpgradeAll, None)
            .unwrap()
            .unwrap();
        assert_eq!(cmd, "yum -y upgrade");

        let cmd = upgrade_command(&Apt, HostAction::UpgradePackage, Some("curl"))
            .unwrap()
            .unwrap();
        assert!(cmd.contains("--only-upgrade curl"));

        assert!(upgrade_command(&Apt, HostAction::UpgradePackage, None).is_err());
        assert!(upgrade_command(&Apt, HostAction::Check, None).unwrap().is_none());
    }
}
