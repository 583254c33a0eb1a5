//! Shared constants grouped by concern.

/// Timeouts for remote operations, in seconds.
pub mod timeouts {
    /// Default per-command timeout for update checks (overridable via config).
    pub const DEFAULT_COMMAND_SECONDS: u64 = 120;

    /// Bulk upgrade (`upgrade_all` / `full_upgrade_all`) timeout.
    pub const BULK_UPGRADE_SECONDS: u64 = 3600;

    /// Single-package upgrade timeout.
    pub const SINGLE_UPGRADE_SECONDS: u64 = 300;

    /// Reboot command timeout; the connection usually dies first.
    pub const REBOOT_SECONDS: u64 = 30;

    /// SSH transport ready/handshake timeout.
    pub const SSH_READY_SECONDS: u64 = 30;
}

/// Reconnection policy after monitoring of a persistent command is lost.
pub mod reconnect {
    /// Total window to regain a session, in seconds.
    pub const WINDOW_SECONDS: u64 = 300;

    /// Pause between reconnection attempts, in seconds.
    pub const RETRY_INTERVAL_SECONDS: u64 = 15;

    /// Post-reboot re-check attempts while the host is still unreachable.
    pub const POST_CHECK_ATTEMPTS: u32 = 3;

    /// Pause between post-reboot re-check attempts, in seconds.
    pub const POST_CHECK_INTERVAL_SECONDS: u64 = 10;
}

/// Periodic staleness sweep.
pub mod scheduler {
    /// Delay after process start before the first sweep, in seconds.
    pub const STARTUP_DELAY_SECONDS: u64 = 30;

    /// Sweep interval, in seconds.
    pub const SWEEP_INTERVAL_SECONDS: u64 = 900;

    /// Default cache horizon after which a host counts as stale, in hours.
    pub const DEFAULT_CACHE_HORIZON_HOURS: u64 = 12;
}

/// Web-surface job registry.
pub mod jobs {
    /// Completed job records are dropped after this many seconds.
    pub const EXPIRY_SECONDS: u64 = 300;

    /// Cleanup tick for the job registry, in seconds.
    pub const CLEANUP_INTERVAL_SECONDS: u64 = 60;
}

/// Credential vault parameters.
pub mod vault {
    /// PBKDF2-HMAC-SHA-256 iteration count for passphrase-derived keys.
    pub const PBKDF2_ITERATIONS: u32 = 600_000;

    /// Random nonce length in the encrypted token.
    pub const NONCE_LEN: usize = 12;

    /// GCM authentication tag length.
    pub const TAG_LEN: usize = 16;

    /// Per-instance salt file size.
    pub const SALT_LEN: usize = 16;

    /// Salt baked into releases before per-instance salt files existed.
    /// Only used by the one-shot migration at startup.
    pub const LEGACY_SALT: &[u8; 16] = b"ludash-static-sa";
}

/// Connection manager defaults.
pub mod ssh {
    /// Default cap on concurrently open outbound SSH sessions.
    pub const DEFAULT_MAX_SESSIONS: usize = 5;

    /// PATH exported in front of every remote command so tooling is found
    /// in non-interactive shells.
    pub const REMOTE_PATH: &str =
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
}

/// Live output bus.
pub mod bus {
    /// Maximum buffered messages per host before the oldest are dropped.
    pub const BUFFER_CAPACITY: usize = 2000;
}

/// History rows.
pub mod history {
    /// Stored command output is truncated to this many characters.
    pub const OUTPUT_TRUNCATE_CHARS: usize = 10_000;
}
