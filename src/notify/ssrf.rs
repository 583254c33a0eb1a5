//! Outbound-safety check for operator-configured push URLs.
//!
//! A push channel URL must never be able to reach the control plane's own
//! network: loopback, RFC 1918, CGNAT, link-local, documentation/benchmark
//! ranges and their IPv6 relatives are all refused, both as literal
//! addresses and behind DNS. Every resolved address must pass, and the
//! HTTP client used for dispatch has redirects disabled so a public URL
//! cannot bounce inward.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::errors::{CoreError, CoreResult};

pub fn is_forbidden_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] & 0xFE) == 18)
        // 192.0.0.0/24 protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

pub fn is_forbidden_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_forbidden_ipv4(&mapped);
    }
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (segments[0] & 0xFE00) == 0xFC00
        // fe80::/10 link local
        || (segments[0] & 0xFFC0) == 0xFE80
        // ff00::/8 multicast
        || (segments[0] & 0xFF00) == 0xFF00
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0DB8)
}

pub fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_ipv4(v4),
        IpAddr::V6(v6) => is_forbidden_ipv6(v6),
    }
}

/// Syntax-level validation: scheme, host shape, literal addresses.
pub fn validate_push_url(raw: &str) -> CoreResult<reqwest::Url> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| CoreError::Validation(format!("invalid URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::Validation(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| CoreError::Validation("URL has no host".into()))?;

    if host.eq_ignore_ascii_case("metadata.google.internal") || host.eq_ignore_ascii_case("localhost")
    {
        return Err(CoreError::Validation(format!("forbidden host: {host}")));
    }

    // Literal address (including bracketed IPv6) checked right here.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_forbidden_ip(&ip) {
            return Err(CoreError::Validation(format!(
                "forbidden address: {ip}"
            )));
        }
    }

    Ok(url)
}

/// Full validation: syntax plus DNS. Every address the hostname resolves
/// to must be publicly routable.
pub async fn validate_outbound_url(raw: &str) -> CoreResult<()> {
    let url = validate_push_url(raw)?;
    let host = url.host_str().unwrap_or_default().to_string();

    // Literal addresses were already vetted.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs: Vec<_> = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|e| CoreError::Validation(format!("hostname {host} did not resolve: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(CoreError::Validation(format!(
            "hostname {host} resolved to no addresses"
        )));
    }

    for addr in addrs {
        if is_forbidden_ip(&addr.ip()) {
            return Err(CoreError::Validation(format!(
                "hostname {host} resolves to forbidden address {}",
                addr.ip()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn v6(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn forbidden_ipv4_ranges() {
        for ip in [
            "127.0.0.1",
            "127.255.255.254",
            "10.0.0.5",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.5",
            "169.254.169.254",
            "100.64.0.1",
            "100.127.255.255",
            "0.0.0.0",
            "255.255.255.255",
            "192.0.2.10",
            "198.51.100.1",
            "203.0.113.7",
            "198.18.0.1",
            "198.19.255.255",
            "192.0.0.1",
            "240.0.0.1",
        ] {
            assert!(is_forbidden_ipv4(&v4(ip)), "{ip} should be forbidden");
        }
    }

    #[test]
    fn allowed_ipv4_addresses() {
        for ip in ["1.1.1.1", "8.8.8.8", "93.184.216.34", "100.63.0.1", "172.32.0.1"] {
            assert!(!is_forbidden_ipv4(&v4(ip)), "{ip} should be allowed");
        }
    }

    #[test]
    fn forbidden_ipv6_ranges() {
        for ip in [
            "::1",
            "::",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "ff02::1",
            "2001:db8::1",
            "::ffff:192.168.1.5",
            "::ffff:10.0.0.1",
        ] {
            assert!(is_forbidden_ipv6(&v6(ip)), "{ip} should be forbidden");
        }
        assert!(!is_forbidden_ipv6(&v6("2606:4700::1111")));
    }

    #[test]
    fn literal_urls_are_vetted() {
        assert!(validate_push_url("http://10.0.0.5/topic").is_err());
        assert!(validate_push_url("http://127.0.0.1:8080/x").is_err());
        assert!(validate_push_url("http://[::1]/x").is_err());
        assert!(validate_push_url("http://169.254.169.254/latest").is_err());
        assert!(validate_push_url("http://metadata.google.internal/computeMetadata").is_err());
        assert!(validate_push_url("http://localhost/x").is_err());
        assert!(validate_push_url("https://ntfy.example.com/fleet").is_ok());
    }

    #[test]
    fn scheme_and_shape_are_enforced() {
        assert!(validate_push_url("ftp://example.com/x").is_err());
        assert!(validate_push_url("not a url").is_err());
    }

    #[tokio::test]
    async fn resolution_of_loopback_names_is_rejected() {
        // "localhost" is refused by name; a numeric loopback literal is
        // refused before DNS is ever consulted.
        assert!(validate_outbound_url("http://localhost:8080/x").await.is_err());
        assert!(validate_outbound_url("http://127.0.0.1/x").await.is_err());
    }
}
