//! Bounded-concurrency SSH connection manager.
//!
//! Every outbound session passes through one global semaphore; the permit is
//! owned by the [`SshSession`] and released when the session drops, so a
//! panicking workflow can never leak a slot. Credentials are decrypted
//! through the vault at connect time and never stored in the session.

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::constants::ssh::REMOTE_PATH;
use crate::database::records::{AuthMode, Host};
use crate::errors::{CoreError, CoreResult};
use crate::ssh::{CommandResult, OutputFrame, OutputSink, StreamKind};
use crate::vault::CredentialVault;

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Hosts are operator-registered; host-key pinning is not part of
        // the trust model (credentials are, via the vault).
        Ok(true)
    }
}

pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    label: String,
    _permit: OwnedSemaphorePermit,
}

impl SshSession {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn disconnect(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

pub struct SshManager {
    semaphore: Arc<Semaphore>,
    vault: Arc<CredentialVault>,
    ready_timeout: Duration,
}

impl SshManager {
    pub fn new(max_sessions: usize, ready_timeout: Duration, vault: Arc<CredentialVault>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_sessions)),
            vault,
            ready_timeout,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Open a session to `host`, waiting for a free slot first. The slot is
    /// released when the returned session drops.
    pub async fn connect(&self, host: &Host) -> CoreResult<SshSession> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Internal("ssh semaphore closed".into()))?;

        let label = format!("{}@{}:{}", host.username, host.hostname, host.port);
        debug!("Connecting to {} ({} slots left)", label, self.semaphore.available_permits());

        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            self.ready_timeout,
            client::connect(
                config,
                (host.hostname.as_str(), host.port as u16),
                ClientHandler,
            ),
        )
        .await
        .map_err(|_| CoreError::Timeout(self.ready_timeout))?
        .map_err(|e| CoreError::Transport(format!("connect to {label} failed: {e}")))?;

        self.authenticate(&mut handle, host, &label).await?;

        Ok(SshSession {
            handle,
            label,
            _permit: permit,
        })
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        host: &Host,
        label: &str,
    ) -> CoreResult<()> {
        let denied = || CoreError::AuthDenied {
            host: host.hostname.clone(),
            user: host.username.clone(),
        };

        let result = match host.auth_mode {
            AuthMode::Password => {
                let token = host
                    .enc_password
                    .as_deref()
                    .ok_or_else(|| CoreError::Config(format!("{label} has no stored password")))?;
                let password = self.vault.decrypt(token)?;
                handle
                    .authenticate_password(&host.username, &password)
                    .await
                    .map_err(|e| CoreError::Transport(format!("auth exchange failed: {e}")))?
            }
            AuthMode::Key => {
                let token = host.enc_private_key.as_deref().ok_or_else(|| {
                    CoreError::Config(format!("{label} has no stored private key"))
                })?;
                let pem = self.vault.decrypt(token)?;
                let passphrase = match host.enc_key_passphrase.as_deref() {
                    Some(t) => Some(self.vault.decrypt(t)?),
                    None => None,
                };
                let key = decode_secret_key(&pem, passphrase.as_deref())
                    .map_err(|e| CoreError::Validation(format!("unusable private key: {e}")))?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| CoreError::Transport(format!("auth exchange failed: {e}")))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        &host.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| CoreError::Transport(format!("auth exchange failed: {e}")))?
            }
        };

        if !result.success() {
            warn!("Authentication denied for {}", label);
            return Err(denied());
        }
        Ok(())
    }

    /// Execute one command on an open session.
    ///
    /// Output is accumulated and, when a sink is given, streamed frame by
    /// frame as it arrives. When `sudo_password` is set it is written to the
    /// remote stdin followed by a newline, then stdin is closed. A timeout
    /// resolves with `{stdout: "", stderr: "timed out", exit: -1}` rather
    /// than an error, matching how callers treat slow commands.
    pub async fn run(
        &self,
        session: &SshSession,
        command: &str,
        timeout: Duration,
        sudo_password: Option<&str>,
        sink: Option<&OutputSink>,
    ) -> CoreResult<CommandResult> {
        let mut channel = session
            .handle
            .channel_open_session()
            .await
            .map_err(|e| CoreError::Transport(format!("channel open failed: {e}")))?;

        // English output, predictable tool lookup in non-interactive shells.
        let full = format!("export LC_ALL=C LANG=C PATH={REMOTE_PATH}; {command}");
        channel
            .exec(true, full.as_str())
            .await
            .map_err(|e| CoreError::Transport(format!("exec failed: {e}")))?;

        if let Some(password) = sudo_password {
            let line = format!("{password}\n");
            channel
                .data(line.as_bytes())
                .await
                .map_err(|e| CoreError::Transport(format!("stdin write failed: {e}")))?;
            channel
                .eof()
                .await
                .map_err(|e| CoreError::Transport(format!("stdin close failed: {e}")))?;
        }

        match tokio::time::timeout(timeout, drain_channel(&mut channel, sink)).await {
            Ok(result) => result,
            Err(_) => {
                let _ = channel.close().await;
                Ok(CommandResult::timed_out())
            }
        }
    }
}

async fn drain_channel(
    channel: &mut russh::Channel<client::Msg>,
    sink: Option<&OutputSink>,
) -> CoreResult<CommandResult> {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit = -1;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => {
                let text = String::from_utf8_lossy(data).into_owned();
                stdout.push_str(&text);
                if let Some(sink) = sink {
                    let _ = sink
                        .send(OutputFrame {
                            data: text,
                            stream: StreamKind::Stdout,
                        })
                        .await;
                }
            }
            Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                let text = String::from_utf8_lossy(data).into_owned();
                stderr.push_str(&text);
                if let Some(sink) = sink {
                    let _ = sink
                        .send(OutputFrame {
                            data: text,
                            stream: StreamKind::Stderr,
                        })
                        .await;
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit = exit_status as i32;
            }
            Some(_) => {}
            None => break,
        }
    }

    Ok(CommandResult {
        stdout,
        stderr,
        exit,
    })
}
