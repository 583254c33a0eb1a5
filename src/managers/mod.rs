//! Package-manager adapters.
//!
//! One adapter per manager encapsulates that manager's shell idioms: how to
//! detect it, which commands list pending updates, how to parse their
//! output and how to compose upgrades. The orchestrator treats adapters as
//! interchangeable strategy objects.

pub mod apt;
pub mod dnf;
pub mod flatpak;
pub mod pacman;
pub mod snap;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, CoreResult};

/// One pending update as reported by a manager's check commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUpdate {
    pub package: String,
    pub current_version: Option<String>,
    pub new_version: Option<String>,
    pub architecture: Option<String>,
    pub repository: Option<String>,
    pub is_security: bool,
    pub manager: String,
}

pub trait PackageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Binary probed with `command -v` during detection.
    fn detect_binary(&self) -> &'static str {
        self.name()
    }

    /// Ordered check commands. Only the final command's output and exit
    /// code feed [`PackageManager::parse_updates`].
    fn check_commands(&self) -> Vec<String>;

    /// One live-output header per check command.
    fn step_labels(&self) -> Vec<&'static str>;

    fn parse_updates(&self, stdout: &str, stderr: &str, exit: i32)
        -> CoreResult<Vec<ParsedUpdate>>;

    fn upgrade_all_command(&self) -> String;

    fn full_upgrade_all_command(&self) -> Option<String> {
        None
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String>;
}

static MANAGERS: Lazy<Vec<Arc<dyn PackageManager>>> = Lazy::new(|| {
    vec![
        Arc::new(apt::Apt),
        Arc::new(dnf::Dnf),
        Arc::new(dnf::Yum),
        Arc::new(pacman::Pacman),
        Arc::new(flatpak::Flatpak),
        Arc::new(snap::Snap),
    ]
});

pub fn all_managers() -> &'static [Arc<dyn PackageManager>] {
    &MANAGERS
}

pub fn manager_by_name(name: &str) -> Option<Arc<dyn PackageManager>> {
    MANAGERS.iter().find(|m| m.name() == name).cloned()
}

/// Outcome of the detection probe on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Found managers, in registry order, with yum suppressed when dnf is
    /// present (yum is a compatibility shim there).
    pub managers: Vec<String>,
    pub sudo_available: bool,
}

/// Single compound probe covering every adapter plus sudo.
pub fn detection_probe_command() -> String {
    let mut parts: Vec<String> = MANAGERS
        .iter()
        .map(|m| {
            format!(
                "command -v {bin} >/dev/null 2>&1 && echo {name}",
                bin = m.detect_binary(),
                name = m.name()
            )
        })
        .collect();
    parts.push("command -v sudo >/dev/null 2>&1 && echo sudo".to_string());
    parts.join("; ")
}

pub fn parse_detection_output(stdout: &str) -> Detection {
    let found: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let sudo_available = found.contains(&"sudo");
    let has_dnf = found.contains(&"dnf");

    let managers = MANAGERS
        .iter()
        .map(|m| m.name())
        .filter(|name| found.contains(name))
        .filter(|name| !(has_dnf && *name == "yum"))
        .map(str::to_string)
        .collect();

    Detection {
        managers,
        sudo_available,
    }
}

static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._+-]+$").unwrap());

/// Package names are interpolated into remote shell commands; anything
/// outside the conservative character set is refused outright.
pub fn validate_package_name(package: &str) -> CoreResult<()> {
    if package.is_empty() || !PACKAGE_NAME.is_match(package) {
        return Err(CoreError::Validation(format!(
            "invalid package name: {package:?}"
        )));
    }
    Ok(())
}

/// Run a command as root through interactive sudo; the password arrives on
/// stdin (`sudo -S`) with an empty prompt.
pub fn wrap_sudo(command: &str) -> String {
    let escaped = command.replace('\'', r"'\''");
    format!("sudo -S -p '' sh -c '{escaped}'")
}

/// Wrap only when the host actually has sudo; root logins run bare.
pub fn wrap_for_host(command: &str, sudo_available: bool) -> String {
    if sudo_available {
        wrap_sudo(command)
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_is_stable() {
        let names: Vec<&str> = all_managers().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["apt", "dnf", "yum", "pacman", "flatpak", "snap"]);
    }

    #[test]
    fn detection_suppresses_yum_when_dnf_present() {
        let det = parse_detection_output("dnf\nyum\nsudo\n");
        assert_eq!(det.managers, vec!["dnf"]);
        assert!(det.sudo_available);
    }

    #[test]
    fn detection_keeps_yum_alone() {
        let det = parse_detection_output("yum\n");
        assert_eq!(det.managers, vec!["yum"]);
        assert!(!det.sudo_available);
    }

    #[test]
    fn detection_preserves_registry_order() {
        let det = parse_detection_output("snap\napt\nflatpak\n");
        assert_eq!(det.managers, vec!["apt", "flatpak", "snap"]);
    }

    #[test]
    fn probe_covers_all_managers() {
        let probe = detection_probe_command();
        for m in all_managers() {
            assert!(probe.contains(&format!("command -v {}", m.detect_binary())));
        }
        assert!(probe.contains("command -v sudo"));
    }

    #[test]
    fn package_name_validation() {
        assert!(validate_package_name("libssl3").is_ok());
        assert!(validate_package_name("gcc-12-base").is_ok());
        assert!(validate_package_name("libstdc++6").is_ok());
        assert!(validate_package_name("python3.11").is_ok());
        assert!(validate_package_name("linux_5.15").is_ok());
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name("pkg; rm -rf /").is_err());
        assert!(validate_package_name("pkg$(id)").is_err());
        assert!(validate_package_name("pkg name").is_err());
        assert!(validate_package_name("pkg'quote").is_err());
    }

    #[test]
    fn sudo_wrap_escapes_quotes() {
        let wrapped = wrap_sudo("echo 'hi'");
        assert_eq!(wrapped, r#"sudo -S -p '' sh -c 'echo '\''hi'\'''"#);
    }

    #[test]
    fn wrap_for_host_skips_without_sudo() {
        assert_eq!(wrap_for_host("ls", false), "ls");
        assert!(wrap_for_host("ls", true).starts_with("sudo -S"));
    }
}
