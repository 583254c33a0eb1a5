//! System-facts probe: one compound command, `===TAG===`-delimited output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::database::records::SystemFacts;

static SECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"===([A-Z]+)===").unwrap());

pub fn facts_probe_command() -> String {
    [
        r#"echo '===OS==='; grep PRETTY_NAME /etc/os-release 2>/dev/null | cut -d= -f2- | tr -d '"'"#,
        "echo '===KERNEL==='; uname -r",
        "echo '===HOSTNAME==='; hostname",
        "echo '===UPTIME==='; cat /proc/uptime 2>/dev/null",
        "echo '===ARCH==='; uname -m",
        "echo '===CPU==='; nproc 2>/dev/null",
        "echo '===MEM==='; grep MemTotal /proc/meminfo 2>/dev/null",
        "echo '===DISK==='; df -P -B1 / 2>/dev/null | tail -n 1",
        "echo '===REBOOT==='; [ -f /var/run/reboot-required ] && echo yes || echo no",
    ]
    .join("; ")
}

pub fn parse_facts(stdout: &str) -> SystemFacts {
    let mut sections: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut current: Option<String> = None;
    let mut body = String::new();

    for line in stdout.lines() {
        if let Some(caps) = SECTION.captures(line.trim()) {
            if let Some(tag) = current.take() {
                sections.insert(tag, body.trim().to_string());
            }
            current = Some(caps[1].to_string());
            body = String::new();
        } else if current.is_some() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some(tag) = current {
        sections.insert(tag, body.trim().to_string());
    }

    let text = |tag: &str| -> Option<String> {
        sections
            .get(tag)
            .map(|s| s.lines().next().unwrap_or("").trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let uptime_seconds = text("UPTIME")
        .and_then(|s| s.split_whitespace().next().map(str::to_string))
        .and_then(|s| s.parse::<f64>().ok())
        .map(|f| f as i64);

    let cpu_cores = text("CPU").and_then(|s| s.parse::<i64>().ok());

    // "MemTotal:       16284896 kB"
    let memory_bytes = text("MEM")
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<i64>().ok())
        })
        .map(|kb| kb * 1024);

    // df -P -B1: filesystem total used available use% mount
    let (disk_total_bytes, disk_free_bytes) = match text("DISK") {
        Some(line) => {
            let cols: Vec<&str> = line.split_whitespace().collect();
            (
                cols.get(1).and_then(|v| v.parse::<i64>().ok()),
                cols.get(3).and_then(|v| v.parse::<i64>().ok()),
            )
        }
        None => (None, None),
    };

    SystemFacts {
        os_name: text("OS"),
        kernel: text("KERNEL"),
        hostname: text("HOSTNAME"),
        uptime_seconds,
        arch: text("ARCH"),
        cpu_cores,
        memory_bytes,
        disk_total_bytes,
        disk_free_bytes,
        needs_reboot: text("REBOOT").is_some_and(|s| s == "yes"),
    }
}
