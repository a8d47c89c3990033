//! Managed-service selection.
//!
//! Decides which network services the daemon is allowed to touch. The
//! default filter is intentionally opinionated: ordinary user-facing
//! interfaces are in, anything that smells like a VPN or tunnel is out, so we
//! never hijack split-DNS or a VPN control plane. Unusual hosts are handled
//! through the exclusion file, not by widening the defaults.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::exec;

const NETWORKSETUP: &str = "/usr/sbin/networksetup";

/// Service-name tokens that mark a service as unmanageable.
const EXCLUDED_NAME_TOKENS: &[&str] = &["vpn", "tailscale", "wireguard", "openvpn", "anyconnect"];

/// Device prefixes that mark a service as unmanageable.
const EXCLUDED_DEVICE_PREFIXES: &[&str] = &["utun", "ppp", "ipsec", "tun", "tap"];

/// Service-name tokens that mark ordinary user-facing interfaces.
const INCLUDED_NAME_TOKENS: &[&str] = &["wi-fi", "wifi", "ethernet", "usb", "thunderbolt", "bridge"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub device: Option<String>,
}

/// Parses `networksetup -listallnetworkservices` output.
///
/// The first line is a notice about asterisks; a leading `*` marks a disabled
/// service. Both are skipped.
pub fn parse_service_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| {
            let t = line.trim();
            !t.is_empty() && !t.starts_with("An asterisk") && !t.starts_with('*')
        })
        .map(|line| line.trim().to_string())
        .collect()
}

/// Extracts the `Device:` line from `networksetup -getinfo` output.
pub fn parse_device(text: &str) -> Option<String> {
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("Device:") {
            let device = rest.trim();
            if !device.is_empty() {
                return Some(device.to_string());
            }
        }
    }
    None
}

/// Default keyword/prefix filter: true when the service should be managed.
pub fn passes_default_filter(name: &str, device: Option<&str>) -> bool {
    let name_l = name.to_lowercase();
    let device = device.unwrap_or("");

    if EXCLUDED_DEVICE_PREFIXES.iter().any(|p| device.starts_with(p)) {
        return false;
    }
    if EXCLUDED_NAME_TOKENS.iter().any(|t| name_l.contains(t)) {
        return false;
    }

    if device.starts_with("en") || device.starts_with("bridge") {
        return true;
    }
    INCLUDED_NAME_TOKENS.iter().any(|t| name_l.contains(t))
}

/// Parses the `dns.exclude_services` override file: one service name per
/// line, `#` comments, blank lines ignored.
pub fn parse_exclude_file(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Loads the exclusion set; a missing or unreadable file excludes nothing.
pub fn load_exclude_set(path: &Path) -> BTreeSet<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_exclude_file(&text),
        Err(_) => BTreeSet::new(),
    }
}

async fn service_device(name: &str) -> Option<String> {
    let r = exec::run(NETWORKSETUP, &["-getinfo", name], Duration::from_secs(10))
        .await
        .ok()?;
    if !r.success() {
        return None;
    }
    parse_device(&r.stdout)
}

/// Lists the services the daemon may touch right now, sorted by name.
pub async fn compute_managed_services(exclude: &BTreeSet<String>) -> Result<Vec<ServiceInfo>> {
    let r = exec::run(NETWORKSETUP, &["-listallnetworkservices"], Duration::from_secs(10)).await?;
    if !r.success() {
        return Ok(Vec::new());
    }

    let mut managed = Vec::new();
    for name in parse_service_list(&r.stdout) {
        if exclude.contains(&name) {
            continue;
        }
        let device = service_device(&name).await;
        if passes_default_filter(&name, device.as_deref()) {
            managed.push(ServiceInfo { name, device });
        }
    }

    managed.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(managed)
}
