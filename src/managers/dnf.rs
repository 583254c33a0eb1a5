//! dnf and yum adapters (Fedora/RHEL family).
//!
//! `check-update` only reports the candidate version, so the check command
//! chases it with an `rpm -q` over the upgradable set to recover installed
//! versions, separated by a marker line, and finishes with `EXIT:<rc>` so
//! the real check-update exit code survives the compound shell. Exit 0
//! (nothing to do) and 100 (updates available) are both success; anything
//! else yields an empty result.
//!
//! yum is dnf's predecessor with the same output shape; it reuses the
//! parser relabeled and is suppressed during detection when dnf exists.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{validate_package_name, PackageManager, ParsedUpdate};
use crate::errors::CoreResult;

const CURRENT_MARKER: &str = "===CURRENT===";

static PACKAGE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\.(\S+)\s+(\S+)\s+(\S+)").unwrap());

fn check_commands_for(binary: &str) -> Vec<String> {
    vec![format!(
        concat!(
            "out=$({binary} check-update --quiet 2>/dev/null); rc=$?; ",
            "echo \"$out\"; echo '{marker}'; ",
            "echo \"$out\" | awk '/^[[:alnum:]]/ {{print $1}}' | sed 's/\\.[^.]*$//' | sort -u | ",
            "xargs -r rpm -q --qf '%{{NAME}}.%{{ARCH}}\\t%{{EPOCH}}:%{{VERSION}}-%{{RELEASE}}\\n'; ",
            "echo \"EXIT:$rc\""
        ),
        binary = binary,
        marker = CURRENT_MARKER
    )]
}

fn parse_check_output(stdout: &str, manager: &str) -> Vec<ParsedUpdate> {
    let embedded_exit = stdout
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix("EXIT:"))
        .and_then(|v| v.trim().parse::<i32>().ok());
    if !matches!(embedded_exit, Some(0) | Some(100)) {
        return Vec::new();
    }

    let (pending_part, current_part) = match stdout.split_once(CURRENT_MARKER) {
        Some((a, b)) => (a, b),
        None => (stdout, ""),
    };

    // name.arch -> installed version, epoch "(none):" stripped.
    let mut current: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for line in current_part.lines() {
        let Some((key, version)) = line.split_once('\t') else {
            continue;
        };
        let version = version
            .trim()
            .strip_prefix("(none):")
            .unwrap_or(version.trim());
        if !key.trim().is_empty() && !version.is_empty() {
            current.insert(key.trim().to_string(), version.to_string());
        }
    }

    let mut updates = Vec::new();
    for line in pending_part.lines() {
        let line_trimmed = line.trim_end();
        if line_trimmed.is_empty()
            || line_trimmed.starts_with("Obsoleting")
            || line_trimmed.starts_with("Last metadata")
            || line_trimmed.starts_with("Security:")
            || line.starts_with(' ')
        {
            continue;
        }
        let Some(caps) = PACKAGE_LINE.captures(line_trimmed) else {
            continue;
        };
        let name = caps[1].to_string();
        let arch = caps[2].to_string();
        let key = format!("{name}.{arch}");
        updates.push(ParsedUpdate {
            package: name,
            current_version: current.get(&key).cloned(),
            new_version: Some(caps[3].to_string()),
            architecture: Some(arch),
            repository: Some(caps[4].to_string()),
            // Repository context exists, but check-update does not say
            // which updates are advisories; left false rather than guessed.
            is_security: false,
            manager: manager.to_string(),
        });
    }
    updates
}

pub struct Dnf;

impl PackageManager for Dnf {
    fn name(&self) -> &'static str {
        "dnf"
    }

    fn check_commands(&self) -> Vec<String> {
        check_commands_for("dnf")
    }

    fn step_labels(&self) -> Vec<&'static str> {
        vec!["Checking for updates"]
    }

    fn parse_updates(
        &self,
        stdout: &str,
        _stderr: &str,
        _exit: i32,
    ) -> CoreResult<Vec<ParsedUpdate>> {
        Ok(parse_check_output(stdout, self.name()))
    }

    fn upgrade_all_command(&self) -> String {
        "dnf -y upgrade".to_string()
    }

    fn full_upgrade_all_command(&self) -> Option<String> {
        Some("dnf -y distro-sync".to_string())
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String> {
        validate_package_name(package)?;
        Ok(format!("dnf -y upgrade {package}"))
    }
}

pub struct Yum;

impl PackageManager for Yum {
    fn name(&self) -> &'static str {
        "yum"
    }

    fn check_commands(&self) -> Vec<String> {
        check_commands_for("yum")
    }

    fn step_labels(&self) -> Vec<&'static str> {
        vec!["Checking for updates"]
    }

    fn parse_updates(
        &self,
        stdout: &str,
        _stderr: &str,
        _exit: i32,
    ) -> CoreResult<Vec<ParsedUpdate>> {
        Ok(parse_check_output(stdout, self.name()))
    }

    fn upgrade_all_command(&self) -> String {
        "yum -y upgrade".to_string()
    }

    fn upgrade_package_command(&self, package: &str) -> CoreResult<String> {
        validate_package_name(package)?;
        Ok(format!("yum -y upgrade {package}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_updates_with_current_versions() {
        let stdout = "curl.x86_64 7.76.1-26.el9_3.3 baseos\n\
                      ===CURRENT===\n\
                      curl.x86_64\t7.76.1-25.el9_3.2\n\
                      EXIT:100\n";
        let updates = parse_check_output(stdout, "dnf");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].package, "curl");
        assert_eq!(updates[0].architecture.as_deref(), Some("x86_64"));
        assert_eq!(
            updates[0].current_version.as_deref(),
            Some("7.76.1-25.el9_3.2")
        );
        assert_eq!(
            updates[0].new_version.as_deref(),
            Some("7.76.1-26.el9_3.3")
        );
        assert_eq!(updates[0].repository.as_deref(), Some("baseos"));
        assert!(!updates[0].is_security);
    }

    #[test]
    fn strips_none_epoch() {
        let stdout = "vim-minimal.x86_64 2:9.0-1.el9 appstream\n\
                      ===CURRENT===\n\
                      vim-minimal.x86_64\t(none):8.2-1.el9\n\
                      EXIT:100\n";
        let updates = parse_check_output(stdout, "dnf");
        assert_eq!(updates[0].current_version.as_deref(), Some("8.2-1.el9"));
    }

    #[test]
    fn exit_zero_means_no_updates() {
        let stdout = "===CURRENT===\nEXIT:0\n";
        assert!(parse_check_output(stdout, "dnf").is_empty());
    }

    #[test]
    fn unexpected_exit_yields_empty() {
        let stdout = "curl.x86_64 7.76.1-26.el9_3.3 baseos\n===CURRENT===\nEXIT:1\n";
        assert!(parse_check_output(stdout, "dnf").is_empty());
    }

    #[test]
    fn skips_obsoleting_and_metadata_lines() {
        let stdout = "Last metadata expiration check: 0:12:02 ago.\n\
                      Obsoleting Packages\n\
                      grub2-tools.x86_64 1:2.06-77.el9 baseos\n\
                      ===CURRENT===\n\
                      EXIT:100\n";
        let updates = parse_check_output(stdout, "dnf");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].package, "grub2-tools");
    }

    #[test]
    fn multi_dot_names_split_on_last_dot() {
        let stdout = "python3.11.x86_64 3.11.5-1.el9 appstream\n\
                      ===CURRENT===\n\
                      EXIT:100\n";
        let updates = parse_check_output(stdout, "dnf");
        assert_eq!(updates[0].package, "python3.11");
        assert_eq!(updates[0].architecture.as_deref(), Some("x86_64"));
    }

    #[test]
    fn yum_relabels_dnf_parsing() {
        let stdout = "curl.x86_64 7.61.1-34.el8 baseos\n===CURRENT===\nEXIT:100\n";
        let updates = Yum.parse_updates(stdout, "", 0).unwrap();
        assert_eq!(updates[0].manager, "yum");
    }

    #[test]
    fn dnf_exposes_distro_sync_yum_does_not() {
        assert_eq!(Dnf.full_upgrade_all_command().as_deref(), Some("dnf -y distro-sync"));
        assert!(Yum.full_upgrade_all_command().is_none());
    }

    #[test]
    fn check_command_embeds_exit_and_marker() {
        let cmds = Dnf.check_commands();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].contains("EXIT:$rc"));
        assert!(cmds[0].contains(CURRENT_MARKER));
        assert!(cmds[0].contains("rpm -q --qf"));
    }
}
