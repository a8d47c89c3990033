//! Reader for the OS resolver table (`scutil --dns`).
//!
//! The output is a sequence of `resolver #N` sections. A section with a
//! `domain` line is a scoped resolver (split DNS, typically pushed by a VPN);
//! one without is part of the global default set. We never propagate loopback
//! or unspecified addresses upstream, since that would loop queries straight
//! back into dnsmasq.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::exec;

const SCUTIL: &str = "/usr/sbin/scutil";

/// Parsed resolver table: global defaults plus per-suffix upstreams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemResolvers {
    pub default: Vec<String>,
    pub per_domain: BTreeMap<String, Vec<String>>,
}

/// True for addresses usable as a forwarding target.
pub fn is_forward_ip(ip: &str) -> bool {
    !ip.is_empty() && !matches!(ip, "127.0.0.1" | "::1" | "0.0.0.0" | "::")
}

fn push_unique(bucket: &mut Vec<String>, ip: &str) {
    if is_forward_ip(ip) && !bucket.iter().any(|x| x == ip) {
        bucket.push(ip.to_string());
    }
}

/// Parses `scutil --dns` output.
///
/// Order of first appearance is preserved within each bucket; duplicates
/// within a bucket are dropped. Trailing dots on scoped domains are stripped.
pub fn parse_scutil_dns(text: &str) -> SystemResolvers {
    let mut out = SystemResolvers::default();

    fn commit(domain: &mut Option<String>, servers: &mut Vec<String>, out: &mut SystemResolvers) {
        let bucket = match domain.take() {
            Some(dom) => out.per_domain.entry(dom).or_default(),
            None => &mut out.default,
        };
        for ip in servers.drain(..) {
            if !bucket.iter().any(|x| x == &ip) {
                bucket.push(ip);
            }
        }
    }

    let mut in_section = false;
    let mut domain: Option<String> = None;
    let mut servers: Vec<String> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();

        if line.starts_with("resolver #") {
            if in_section {
                commit(&mut domain, &mut servers, &mut out);
            }
            in_section = true;
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // "nameserver[0]" and plain "nameserver" both occur in the wild.
        let key = key.trim().split('[').next().unwrap_or("").trim();
        let value = value.trim();

        match key {
            "domain" => {
                let dom = value.trim_end_matches('.').to_ascii_lowercase();
                if !dom.is_empty() {
                    domain = Some(dom);
                }
            }
            "nameserver" => push_unique(&mut servers, value),
            _ => {}
        }
    }

    if in_section {
        commit(&mut domain, &mut servers, &mut out);
    }

    out
}

/// Reads and parses the live resolver table.
pub async fn read_system_resolvers() -> Result<SystemResolvers> {
    let r = exec::run(SCUTIL, &["--dns"], Duration::from_secs(10)).await?;
    if !r.success() {
        // An empty table is valid (no network); treat failure the same way
        // and let the fallback upstreams cover it.
        return Ok(SystemResolvers::default());
    }
    Ok(parse_scutil_dns(&r.stdout))
}
