//! apt adapter (Debian/Ubuntu).
//!
//! `apt list --upgradable` lines look like
//! `curl/jammy-updates 7.81.0-1ubuntu1.18 amd64 [upgradable from: 7.81.0-1ubuntu1.16]`.
//! A repository containing `security` marks the update as a security fix.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{validate_package_name, PackageManager, ParsedUpdate};
use crate::errors::{CoreError, CoreResult};

static UPGRADABLE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^/\s]+)/(\S+)\s+(\S+)\s+(\S+)(?:\s+\[upgradable from:\s+([^\]]+)\])?").unwrap()
});

pub struct Apt;

impl PackageManager for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn check_commands(&self) -> Vec<String> {
        vec![
            // Lock-wait so a concurrent unattended-upgrades run does not
            // fail the refresh.
            "DEBIAN_FRONTEND=noninteractive apt-get update -o DPkg::Lock::Timeout=60 -qq"
                .to_string(),
            "apt list --upgradable 2>/dev/null".to_string(),
        ]
    }

    fn step_labels(&self) -> Vec<&'static str> {
        vec!["Refreshing package indices", "Listing upgradable packages"]
    }

    fn parse_updates(
        &self,
        stdout: &str,
        _stderr: &str,
        exit: i32,
    ) -> CoreResult<Vec<ParsedUpdate>> {
        if exit != 0 {
            return Err(CoreError::Parse(format!("apt list exited with {exit}")));
        }

        let mut updates = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("Listing...") {
                continue;
            }
            let Some(caps) = UPGRADABLE_LINE.captures(line) else {
                continue;
            };
            let repository = caps[2].to_string();
            updates.push(ParsedUpdate {
                package: caps[1].to_string(),
                current_version: caps.get(5).map(|m| m.as_str().to_string()),
                new_version: Some(caps[3].to_string()),
                architecture: Some(caps[4].to_string()),
                is_security: repository.contains("security"),
                repository: Some(repository),
                manager: self.name().to_string(),
            });
        }
        Ok(updates)
    }

    fn upgrade_all_command(&self) -> String {
        "DEBIAN_FRONTEND=noninteractive apt-get -y upgrade".to_string()
    }

    fn full_upgrade_all_command(&self) -> Option<String> {
        Some("DEBIAN_FRONTEND=noninteractive apt-get -y full-upgrade".to_string())
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String> {
        validate_package_name(package)?;
        Ok(format!(
            "DEBIAN_FRONTEND=noninteractive apt-get -y install --only-upgrade {package}"
        ))
    }
}
