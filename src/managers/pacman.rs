//! pacman adapter (Arch).

use once_cell::sync::Lazy;
use regex::Regex;

use super::{validate_package_name, PackageManager, ParsedUpdate};
use crate::errors::CoreResult;

static OUTDATED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+(\S+)\s+->\s+(\S+)").unwrap());

pub struct Pacman;

impl PackageManager for Pacman {
    fn name(&self) -> &'static str {
        "pacman"
    }

    fn check_commands(&self) -> Vec<String> {
        vec![
            "pacman -Sy --noconfirm".to_string(),
            "pacman -Qu".to_string(),
        ]
    }

    fn step_labels(&self) -> Vec<&'static str> {
        vec!["Synchronizing package databases", "Listing outdated packages"]
    }

    fn parse_updates(
        &self,
        stdout: &str,
        _stderr: &str,
        _exit: i32,
    ) -> CoreResult<Vec<ParsedUpdate>> {
        // `pacman -Qu` exits 1 when nothing is outdated; parse whatever
        // lines are present instead of gating on the exit code.
        let mut updates = Vec::new();
        for line in stdout.lines() {
            let Some(caps) = OUTDATED_LINE.captures(line.trim()) else {
                continue;
            };
            updates.push(ParsedUpdate {
                package: caps[1].to_string(),
                current_version: Some(caps[2].to_string()),
                new_version: Some(caps[3].to_string()),
                architecture: None,
                repository: None,
                is_security: false,
                manager: self.name().to_string(),
            });
        }
        Ok(updates)
    }

    fn upgrade_all_command(&self) -> String {
        "pacman -Syu --noconfirm".to_string()
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String> {
        validate_package_name(package)?;
        Ok(format!("pacman -S --noconfirm {package}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_old_arrow_new() {
        let stdout = "linux 6.6.1.arch1-1 -> 6.6.2.arch1-1\n\
                      openssl 3.1.4-1 -> 3.2.0-1\n";
        let updates = Pacman.parse_updates(stdout, "", 0).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].package, "linux");
        assert_eq!(updates[0].current_version.as_deref(), Some("6.6.1.arch1-1"));
        assert_eq!(updates[0].new_version.as_deref(), Some("6.6.2.arch1-1"));
    }

    #[test]
    fn no_output_means_no_updates() {
        assert!(Pacman.parse_updates("", "", 1).unwrap().is_empty());
    }

    #[test]
    fn ignores_ignored_package_markers() {
        let stdout = "linux 6.6.1-1 -> 6.6.2-1 [ignored]\n";
        let updates = Pacman.parse_updates(stdout, "", 0).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].new_version.as_deref(), Some("6.6.2-1"));
    }
}
