//! Disconnect-survivable remote jobs.
//!
//! Upgrades can reboot the host mid-run, so they are launched detached: the
//! target command goes into a mktemp script whose runner writes the exit
//! code to a sentinel file and removes the script. The launch wrapper prints
//! exactly one `LUDASH_BG` line identifying the PID and the log/exit paths;
//! everything after that works off those three values, including re-attaching
//! after a reconnect.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{CoreError, CoreResult};
use crate::sanitize::sanitize;
use crate::ssh::manager::{SshManager, SshSession};
use crate::ssh::OutputSink;

static SENTINEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LUDASH_BG PID=(\d+) LOG=(\S+) EXIT=(\S+)").unwrap());

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// Identity of a detached remote job. Survives in memory across SSH
/// sessions; the remote side is identified purely by these three values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentHandle {
    pub pid: u32,
    pub log_path: String,
    pub exit_path: String,
}

/// How a monitored or resumed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentOutcome {
    /// The remote process finished; actual exit code (`-1` when the exit
    /// file could not be read back).
    Exited(i32),
    /// Local visibility dropped (timeout or transport loss); the remote
    /// side may still be running. Caller should reconnect and resume.
    MonitoringLost,
    /// The job's temp files no longer exist remotely, typically because a
    /// reboot cleared /tmp. Caller must infer the result from state.
    FilesGone,
}

/// Launch `command` detached on the remote host.
///
/// When the command uses interactive sudo, it is rewritten to `sudo -n`
/// inside the script and the launch wrapper itself runs under interactive
/// sudo instead, so root is obtained exactly once at launch time. A missing
/// sentinel or failed launch is fatal; there is no fallback to direct
/// execution.
pub async fn launch(
    manager: &SshManager,
    session: &SshSession,
    command: &str,
    sudo_password: Option<&str>,
) -> CoreResult<PersistentHandle> {
    let target = if sudo_password.is_some() {
        rewrite_interactive_sudo(command)
    } else {
        command.to_string()
    };

    let wrapper = launch_wrapper(&target);
    let launch_cmd = match sudo_password {
        Some(_) => crate::managers::wrap_sudo(&wrapper),
        None => wrapper,
    };

    let result = manager
        .run(session, &launch_cmd, LAUNCH_TIMEOUT, sudo_password, None)
        .await?;

    if result.exit != 0 {
        return Err(CoreError::Internal(format!(
            "persistent launch failed (exit {}): {}",
            result.exit,
            sanitize(result.stderr.trim())
        )));
    }

    let handle = parse_sentinel(&result.stdout).ok_or_else(|| {
        CoreError::Internal(format!(
            "persistent launch printed no sentinel: {}",
            sanitize(result.stdout.trim())
        ))
    })?;

    debug!(
        "Detached job on {}: pid={} log={}",
        session.label(),
        handle.pid,
        handle.log_path
    );
    Ok(handle)
}

/// Follow a running job's log until the process exits.
pub async fn monitor(
    manager: &SshManager,
    session: &SshSession,
    handle: &PersistentHandle,
    timeout: Duration,
    sink: Option<&OutputSink>,
) -> CoreResult<PersistentOutcome> {
    let tail = format!(
        "tail --pid={} -f {} 2>/dev/null",
        handle.pid, handle.log_path
    );

    let result = match manager.run(session, &tail, timeout, None, sink).await {
        Ok(r) => r,
        Err(e) if matches!(e, CoreError::Transport(_) | CoreError::Timeout(_)) => {
            warn!("Monitoring lost for pid {} on {}: {}", handle.pid, session.label(), e);
            return Ok(PersistentOutcome::MonitoringLost);
        }
        Err(e) => return Err(e),
    };

    if result.exit == -1 && result.stderr == "timed out" {
        return Ok(PersistentOutcome::MonitoringLost);
    }

    // Tail closed normally: the watched process is gone.
    let code = read_exit_code(manager, session, handle).await?;
    cleanup(manager, session, handle).await;
    Ok(PersistentOutcome::Exited(code))
}

/// Re-attach to a job after reconnecting.
pub async fn resume(
    manager: &SshManager,
    session: &SshSession,
    handle: &PersistentHandle,
    timeout: Duration,
    sink: Option<&OutputSink>,
) -> CoreResult<PersistentOutcome> {
    let probe = format!(
        "[ -e {} ] && echo present || echo missing",
        handle.log_path
    );
    let result = manager
        .run(session, &probe, PROBE_TIMEOUT, None, None)
        .await?;
    if result.stdout.contains("missing") {
        debug!("Job files gone on {} (pid {})", session.label(), handle.pid);
        return Ok(PersistentOutcome::FilesGone);
    }

    let exit_probe = format!(
        "if [ -e {exit} ]; then cat {exit}; else echo __PENDING__; fi",
        exit = handle.exit_path
    );
    let result = manager
        .run(session, &exit_probe, PROBE_TIMEOUT, None, None)
        .await?;
    let exit_raw = result.stdout.trim();
    if !exit_raw.contains("__PENDING__") {
        let code = exit_raw.parse::<i32>().unwrap_or(-1);
        // Deliver the captured log so the caller sees what happened while
        // we were away.
        if let Some(sink) = sink {
            let tail = format!("tail -n 200 {} 2>/dev/null", handle.log_path);
            let _ = manager.run(session, &tail, PROBE_TIMEOUT, None, Some(sink)).await;
        }
        cleanup(manager, session, handle).await;
        return Ok(PersistentOutcome::Exited(code));
    }

    let liveness = format!("kill -0 {} 2>/dev/null && echo alive || echo dead", handle.pid);
    let result = manager
        .run(session, &liveness, PROBE_TIMEOUT, None, None)
        .await?;
    if result.stdout.contains("alive") {
        return monitor(manager, session, handle, timeout, sink).await;
    }

    // Process dead without an exit file: the runner never got to write it.
    Ok(PersistentOutcome::FilesGone)
}

// The `&` must background only the nohup job, so everything before it is
// `;`-separated: an `&&` chain would be backgrounded as a whole and the
// sentinel would print before (and without) the variables.
fn launch_wrapper(target_command: &str) -> String {
    let encoded = BASE64.encode(target_command);
    format!(
        concat!(
            "SCRIPT=$(mktemp /tmp/ludash_XXXXXX.sh) || exit 1; ",
            "echo '{encoded}' | base64 -d > \"$SCRIPT\" || exit 1; ",
            "LOGFILE=\"${{SCRIPT%.sh}}.log\"; EXITFILE=\"${{SCRIPT%.sh}}.exit\"; ",
            "nohup sh -c 'sh \"$0\"; echo $? > \"$1\"; rm -f \"$0\"' \"$SCRIPT\" \"$EXITFILE\" ",
            "> \"$LOGFILE\" 2>&1 & ",
            "echo \"LUDASH_BG PID=$! LOG=$LOGFILE EXIT=$EXITFILE\""
        ),
        encoded = encoded
    )
}

fn parse_sentinel(stdout: &str) -> Option<PersistentHandle> {
    let caps = SENTINEL.captures(stdout)?;
    Some(PersistentHandle {
        pid: caps[1].parse().ok()?,
        log_path: caps[2].to_string(),
        exit_path: caps[3].to_string(),
    })
}

/// The detached script has no stdin, so interactive sudo inside it would
/// hang forever. Root is obtained by the launch wrapper instead.
fn rewrite_interactive_sudo(command: &str) -> String {
    command.replace("sudo -S -p ''", "sudo -n")
}

async fn read_exit_code(
    manager: &SshManager,
    session: &SshSession,
    handle: &PersistentHandle,
) -> CoreResult<i32> {
    let cmd = format!("cat {} 2>/dev/null", handle.exit_path);
    let result = manager.run(session, &cmd, PROBE_TIMEOUT, None, None).await?;
    Ok(result.stdout.trim().parse::<i32>().unwrap_or(-1))
}

async fn cleanup(manager: &SshManager, session: &SshSession, handle: &PersistentHandle) {
    let cmd = format!("rm -f {} {}", handle.log_path, handle.exit_path);
    if let Err(e) = manager.run(session, &cmd, PROBE_TIMEOUT, None, None).await {
        warn!("Could not clean up job files on {}: {}", session.label(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_parses() {
        let out = "some noise\nLUDASH_BG PID=4711 LOG=/tmp/ludash_ab12.log EXIT=/tmp/ludash_ab12.exit\n";
        let handle = parse_sentinel(out).unwrap();
        assert_eq!(handle.pid, 4711);
        assert_eq!(handle.log_path, "/tmp/ludash_ab12.log");
        assert_eq!(handle.exit_path, "/tmp/ludash_ab12.exit");
    }

    #[test]
    fn sentinel_missing_is_none() {
        assert!(parse_sentinel("nohup: appending output\n").is_none());
        assert!(parse_sentinel("LUDASH_BG PID=x LOG=a EXIT=b").is_none());
    }

    #[test]
    fn wrapper_encodes_command_and_cleans_up() {
        let wrapper = launch_wrapper("apt-get -y upgrade");
        let encoded = BASE64.encode("apt-get -y upgrade");
        assert!(wrapper.contains(&encoded));
        assert!(!wrapper.contains("apt-get -y upgrade"));
        // script self-deletes; exit code lands in the sentinel file
        assert!(wrapper.contains(r#"rm -f "$0""#));
        assert!(wrapper.contains(r#"echo $? > "$1""#));
        assert!(wrapper.contains("mktemp /tmp/ludash_XXXXXX.sh"));
        assert!(wrapper.contains("LUDASH_BG PID=$!"));
    }

    #[test]
    fn interactive_sudo_is_rewritten_for_detached_run() {
        let cmd = "sudo -S -p '' sh -c 'apt-get -y upgrade'";
        assert_eq!(
            rewrite_interactive_sudo(cmd),
            "sudo -n sh -c 'apt-get -y upgrade'"
        );
        assert_eq!(rewrite_interactive_sudo("dnf -y upgrade"), "dnf -y upgrade");
    }
}
