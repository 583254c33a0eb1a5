//! Core error kinds shared across the SSH, orchestration and notification
//! layers.
//!
//! Handlers and background loops work with `anyhow::Result` and attach
//! context; this enum exists for the cases callers must match on (auth vs
//! transport failures, the persistent-engine sentinels, terminal remote
//! exits).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The remote host rejected our credentials.
    #[error("authentication denied for {user}@{host}")]
    AuthDenied { host: String, user: String },

    /// Transport-level failure: TCP, SSH handshake, channel loss.
    #[error("transport error: {0}")]
    Transport(String),

    /// A local deadline expired before the remote side answered.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The remote command finished with a non-zero exit code.
    #[error("remote command exited with code {0}")]
    RemoteExit(i32),

    /// Remote output did not match the expected shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// Visibility into a persistent command was lost; the remote side may
    /// still be running. Callers should attempt reconnection.
    #[error("monitoring of remote command lost")]
    MonitoringLost,

    /// The persistent command's temp files no longer exist remotely
    /// (typically after a reboot cleared /tmp). Callers must infer the
    /// result from observable state.
    #[error("remote job files are gone")]
    FilesGone,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Errors that indicate the connection itself died rather than the
    /// command failing. Used by the reboot workflow, where a dropped
    /// connection is the expected outcome.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, CoreError::Transport(_) | CoreError::Timeout(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
