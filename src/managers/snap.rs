//! snap adapter.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{validate_package_name, PackageManager, ParsedUpdate};
use crate::errors::CoreResult;

const REFRESH_MARKER: &str = "===REFRESH===";

static COLUMNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\S+)\s+(\S+)").unwrap());

pub struct Snap;

impl PackageManager for Snap {
    fn name(&self) -> &'static str {
        "snap"
    }

    fn check_commands(&self) -> Vec<String> {
        vec![format!(
            "snap list; echo '{REFRESH_MARKER}'; snap refresh --list 2>&1"
        )]
    }

    fn step_labels(&self) -> Vec<&'static str> {
        vec!["Checking snap refreshes"]
    }

    fn parse_updates(
        &self,
        stdout: &str,
        _stderr: &str,
        _exit: i32,
    ) -> CoreResult<Vec<ParsedUpdate>> {
        let (installed_part, refresh_part) = match stdout.split_once(REFRESH_MARKER) {
            Some(parts) => parts,
            None => (stdout, ""),
        };

        let mut installed: std::collections::HashMap<&str, &str> =
            std::collections::HashMap::new();
        for line in installed_part.lines().skip_while(|l| !l.starts_with("Name")).skip(1) {
            if let Some(caps) = COLUMNS.captures(line) {
                installed.insert(
                    caps.get(1).unwrap().as_str(),
                    caps.get(2).unwrap().as_str(),
                );
            }
        }

        let mut updates = Vec::new();
        for line in refresh_part.lines() {
            let line = line.trim_end();
            if line.is_empty()
                || line.starts_with("Name")
                || line.contains("All snaps up to date")
            {
                continue;
            }
            let Some(caps) = COLUMNS.captures(line) else {
                continue;
            };
            let name = caps.get(1).unwrap().as_str();
            updates.push(ParsedUpdate {
                package: name.to_string(),
                current_version: installed.get(name).map(|v| v.to_string()),
                new_version: Some(caps.get(2).unwrap().as_str().to_string()),
                architecture: None,
                repository: None,
                is_security: false,
                manager: self.name().to_string(),
            });
        }
        Ok(updates)
    }

    fn upgrade_all_command(&self) -> String {
        "snap refresh".to_string()
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String> {
        validate_package_name(package)?;
        Ok(format!("snap refresh {package}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_refresh_list_with_current_versions() {
        let stdout = "Name     Version  Rev   Tracking  Publisher  Notes\n\
                      core22   20231123 1033  latest    canonical  base\n\
                      firefox  120.0-1  3456  latest    mozilla    -\n\
                      ===REFRESH===\n\
                      Name     Version  Rev   Size  Publisher  Notes\n\
                      firefox  121.0-1  3467  70MB  mozilla    -\n";
        let updates = Snap.parse_updates(stdout, "", 0).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].package, "firefox");
        assert_eq!(updates[0].current_version.as_deref(), Some("120.0-1"));
        assert_eq!(updates[0].new_version.as_deref(), Some("121.0-1"));
    }

    #[test]
    fn up_to_date_message_is_ignored() {
        let stdout = "Name  Version  Rev  Tracking  Publisher  Notes\n\
                      ===REFRESH===\n\
                      All snaps up to date.\n";
        assert!(Snap.parse_updates(stdout, "", 0).unwrap().is_empty());
    }

    #[test]
    fn refresh_header_row_is_skipped() {
        let stdout = "Name  Version  Rev  Tracking  Publisher  Notes\n\
                      ===REFRESH===\n\
                      Name  Version  Rev  Size  Publisher  Notes\n";
        assert!(Snap.parse_updates(stdout, "", 0).unwrap().is_empty());
    }
}
