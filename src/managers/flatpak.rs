//! flatpak adapter.
//!
//! `flatpak remote-ls --updates` does not know installed versions, so the
//! check also emits the installed app list and the parser joins the two
//! sections on application id.

use super::{validate_package_name, PackageManager, ParsedUpdate};
use crate::errors::CoreResult;

const INSTALLED_MARKER: &str = "===INSTALLED===";
const UPDATES_MARKER: &str = "===UPDATES===";

pub struct Flatpak;

impl PackageManager for Flatpak {
    fn name(&self) -> &'static str {
        "flatpak"
    }

    fn check_commands(&self) -> Vec<String> {
        vec![format!(
            concat!(
                "flatpak update --appstream -y >/dev/null 2>&1; ",
                "echo '{installed}'; ",
                "flatpak list --app --columns=application,version; ",
                "echo '{updates}'; ",
                "flatpak remote-ls --updates --columns=name,application,version,branch,origin"
            ),
            installed = INSTALLED_MARKER,
            updates = UPDATES_MARKER
        )]
    }

    fn step_labels(&self) -> Vec<&'static str> {
        vec!["Checking flatpak updates"]
    }

    fn parse_updates(
        &self,
        stdout: &str,
        _stderr: &str,
        _exit: i32,
    ) -> CoreResult<Vec<ParsedUpdate>> {
        let installed_part = section_between(stdout, INSTALLED_MARKER, UPDATES_MARKER);
        let updates_part = section_after(stdout, UPDATES_MARKER);

        let mut installed: std::collections::HashMap<&str, &str> =
            std::collections::HashMap::new();
        for line in installed_part.lines() {
            let mut cols = line.split('\t');
            if let (Some(app), Some(version)) = (cols.next(), cols.next()) {
                if !app.trim().is_empty() {
                    installed.insert(app.trim(), version.trim());
                }
            }
        }

        let mut updates = Vec::new();
        for line in updates_part.lines() {
            let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
            if cols.len() < 5 || cols[1].is_empty() {
                continue;
            }
            let app_id = cols[1];
            updates.push(ParsedUpdate {
                package: app_id.to_string(),
                current_version: installed.get(app_id).map(|v| v.to_string()),
                new_version: Some(cols[2].to_string()),
                architecture: None,
                repository: Some(cols[4].to_string()),
                is_security: false,
                manager: self.name().to_string(),
            });
        }
        Ok(updates)
    }

    fn upgrade_all_command(&self) -> String {
        "flatpak update -y".to_string()
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String> {
        validate_package_name(package)?;
        Ok(format!("flatpak update -y {package}"))
    }
}

fn section_between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let after = match text.split_once(start) {
        Some((_, rest)) => rest,
        None => return "",
    };
    match after.split_once(end) {
        Some((section, _)) => section,
        None => after,
    }
}

fn section_after<'a>(text: &'a str, marker: &str) -> &'a str {
    text.split_once(marker).map(|(_, rest)| rest).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_installed_versions_onto_updates() {
        let stdout = "===INSTALLED===\n\
                      org.mozilla.firefox\t120.0\n\
                      org.videolan.VLC\t3.0.19\n\
                      ===UPDATES===\n\
                      Firefox\torg.mozilla.firefox\t121.0\tstable\tflathub\n";
        let updates = Flatpak.parse_updates(stdout, "", 0).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].package, "org.mozilla.firefox");
        assert_eq!(updates[0].current_version.as_deref(), Some("120.0"));
        assert_eq!(updates[0].new_version.as_deref(), Some("121.0"));
        assert_eq!(updates[0].repository.as_deref(), Some("flathub"));
    }

    #[test]
    fn update_without_installed_entry_has_unknown_current() {
        let stdout = "===INSTALLED===\n\
                      ===UPDATES===\n\
                      VLC\torg.videolan.VLC\t3.0.20\tstable\tflathub\n";
        let updates = Flatpak.parse_updates(stdout, "", 0).unwrap();
        assert!(updates[0].current_version.is_none());
    }

    #[test]
    fn short_lines_are_skipped() {
        let stdout = "===INSTALLED===\n===UPDATES===\nnot-enough-columns\n";
        assert!(Flatpak.parse_updates(stdout, "", 0).unwrap().is_empty());
    }
}
