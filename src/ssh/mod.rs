//! SSH layer: bounded connection management, command execution and
//! disconnect-survivable remote jobs.

pub mod manager;
pub mod persistent;

pub use self::manager::{SshManager, SshSession};
pub use self::persistent::{PersistentHandle, PersistentOutcome};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One chunk of remote output, tagged with its stream.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub data: String,
    pub stream: StreamKind,
}

/// Bounded channel end that receives output frames while a command runs.
/// The live bus is the usual consumer.
pub type OutputSink = tokio::sync::mpsc::Sender<OutputFrame>;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit: i32,
}

impl CommandResult {
    pub fn timed_out() -> Self {
        Self {
            stdout: String::new(),
            stderr: "timed out".to_string(),
            exit: -1,
        }
    }
}
