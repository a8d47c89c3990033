//! Upstream rendering for dnsmasq (`upstream.conf`).
//!
//! Translates the live OS resolver table into `server=` lines: global
//! defaults forward everything, scoped resolvers become `server=/domain/ip`
//! so split DNS keeps working while we sit in the middle. When the OS has no
//! usable defaults (mid-transition, captive portal), the persisted fallback
//! file keeps resolution alive.

use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::fs::write_atomic;
use crate::resolvers::{is_forward_ip, SystemResolvers};
use crate::services::ServiceInfo;
use crate::state::{DnsServers, State};
use crate::system_dns;

/// Seed fallbacks used at install and by `upstreams reset`.
pub const DEFAULT_FALLBACKS: &[&str] = &["1.1.1.1", "8.8.8.8"];

fn push_unique(bucket: &mut Vec<String>, ip: &str) {
    if is_forward_ip(ip) && !bucket.iter().any(|x| x == ip) {
        bucket.push(ip.to_string());
    }
}

/// Gathers default upstreams: the resolver table first, then DHCP-provided
/// nameservers of managed devices, then servers remembered in DNS backups.
/// Order of first appearance wins; loopback never qualifies.
pub async fn collect_defaults(
    resolvers: &SystemResolvers,
    managed: &[ServiceInfo],
    state: &State,
) -> Vec<String> {
    let mut defaults = Vec::new();

    for ip in &resolvers.default {
        push_unique(&mut defaults, ip);
    }

    for info in managed {
        if let Some(device) = &info.device {
            for ip in system_dns::read_dhcp_nameservers(device).await {
                push_unique(&mut defaults, &ip);
            }
        }
    }

    for backup in state.dns_backup.values() {
        if let DnsServers::Servers(list) = &backup.dns {
            for ip in list {
                push_unique(&mut defaults, ip);
            }
        }
    }

    defaults
}

/// Renders the dnsmasq servers file.
pub fn render(defaults: &[String], resolvers: &SystemResolvers, fallbacks: &[String]) -> String {
    let mut lines: Vec<String> = Vec::new();

    if defaults.is_empty() {
        for ip in fallbacks {
            if is_forward_ip(ip) {
                lines.push(format!("server={ip}"));
            }
        }
    } else {
        for ip in defaults {
            lines.push(format!("server={ip}"));
        }
    }

    for (domain, ips) in &resolvers.per_domain {
        for ip in ips {
            if is_forward_ip(ip) {
                lines.push(format!("server=/{domain}/{ip}"));
            }
        }
    }

    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Reads the fallback file: one IP per line, `#` comments; non-IP lines are
/// dropped.
pub fn read_fallbacks(path: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return DEFAULT_FALLBACKS.iter().map(|s| s.to_string()).collect();
    };

    let mut ips = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.parse::<std::net::IpAddr>().is_ok() && !ips.iter().any(|x| x == line) {
            ips.push(line.to_string());
        }
    }
    ips
}

/// Writes the fallback file atomically.
pub fn write_fallbacks(path: &Path, ips: &[String]) -> Result<()> {
    let mut text = String::new();
    for ip in ips {
        text.push_str(ip);
        text.push('\n');
    }
    write_atomic(path, text.as_bytes(), 0o644)?;
    Ok(())
}

/// Renders and writes `upstream.conf` for the current host state.
pub async fn write_upstream_conf(
    upstream_conf: &Path,
    fallbacks_file: &Path,
    resolvers: &SystemResolvers,
    managed: &[ServiceInfo],
    state: &State,
) -> Result<()> {
    let defaults = collect_defaults(resolvers, managed, state).await;
    let fallbacks = read_fallbacks(fallbacks_file);
    let text = render(&defaults, resolvers, &fallbacks);
    debug!("writing {} ({} bytes)", upstream_conf.display(), text.len());
    write_atomic(upstream_conf, text.as_bytes(), 0o644)?;
    Ok(())
}
