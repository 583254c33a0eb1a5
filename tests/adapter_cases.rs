//! Table-driven adapter scenarios: realistic remote output through the
//! parsers, end to end from raw bytes to `ParsedUpdate` rows.

use rstest::rstest;

use ludash::managers::apt::Apt;
use ludash::managers::dnf::Dnf;
use ludash::managers::{manager_by_name, validate_package_name, PackageManager};

#[test]
fn apt_two_updates_one_security() {
    let stdout = "curl/jammy-updates 7.81.0-1ubuntu1.18 amd64 [upgradable from: 7.81.0-1ubuntu1.16]\n\
                  openssl/jammy-security 3.0.2-0ubuntu1.18 amd64 [upgradable from: 3.0.2-0ubuntu1.16]\n";
    let updates = Apt.parse_updates(stdout, "", 0).unwrap();

    assert_eq!(updates.len(), 2);
    let curl = updates.iter().find(|u| u.package == "curl").unwrap();
    assert!(!curl.is_security);
    assert_eq!(curl.new_version.as_deref(), Some("7.81.0-1ubuntu1.18"));
    assert_eq!(curl.current_version.as_deref(), Some("7.81.0-1ubuntu1.16"));

    let openssl = updates.iter().find(|u| u.package == "openssl").unwrap();
    assert!(openssl.is_security);
}

#[test]
fn dnf_exit_100_recovers_current_version() {
    let stdout = "curl.x86_64 7.76.1-26.el9_3.3 baseos\n\
                  ===CURRENT===\n\
                  curl.x86_64\t7.76.1-25.el9_3.2\n\
                  EXIT:100\n";
    let updates = Dnf.parse_updates(stdout, "", 0).unwrap();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].package, "curl");
    assert_eq!(updates[0].current_version.as_deref(), Some("7.76.1-25.el9_3.2"));
    assert_eq!(updates[0].new_version.as_deref(), Some("7.76.1-26.el9_3.3"));
}

#[rstest]
#[case("curl")]
#[case("gcc-12-base")]
#[case("libstdc++6")]
#[case("python3.11")]
#[case("org.mozilla.firefox")]
fn valid_package_names(#[case] name: &str) {
    assert!(validate_package_name(name).is_ok());
}

#[rstest]
#[case("")]
#[case("curl; rm -rf /")]
#[case("curl && reboot")]
#[case("$(id)")]
#[case("pkg`id`")]
#[case("pkg name")]
#[case("päckage")]
fn hostile_package_names_are_rejected(#[case] name: &str) {
    assert!(validate_package_name(name).is_err());
}

#[rstest]
#[case("apt", true)]
#[case("dnf", true)]
#[case("yum", false)]
#[case("pacman", false)]
#[case("flatpak", false)]
#[case("snap", false)]
fn full_upgrade_availability(#[case] manager: &str, #[case] has_full: bool) {
    let adapter = manager_by_name(manager).unwrap();
    assert_eq!(adapter.full_upgrade_all_command().is_some(), has_full);
}

#[rstest]
#[case("apt")]
#[case("dnf")]
#[case("yum")]
#[case("pacman")]
#[case("flatpak")]
#[case("snap")]
fn every_adapter_rejects_injection_in_upgrade_one(#[case] manager: &str) {
    let adapter = manager_by_name(manager).unwrap();
    assert!(adapter.upgrade_package_command("curl'; reboot #").is_err());
    let command = adapter.upgrade_package_command("curl").unwrap();
    assert!(command.contains("curl"));
}
