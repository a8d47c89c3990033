//! Per-service system DNS control via networksetup.
//!
//! networksetup's interface is stringly: reading a service with no static
//! servers prints a sentence, and writing the literal `Empty` hands the
//! service back to DHCP. [`DnsServers::Empty`] models that sentinel all the
//! way through the state file so a restore reproduces the pre-intercept
//! configuration exactly.

use std::time::Duration;

use crate::error::{MacblockError, Result};
use crate::exec;
use crate::state::{DnsServers, ServiceBackup};

const NETWORKSETUP: &str = "/usr/sbin/networksetup";
const IPCONFIG: &str = "/usr/sbin/ipconfig";

pub const LOOPBACK_DNS: &str = "127.0.0.1";

fn cmd_timeout() -> Duration {
    Duration::from_secs(15)
}

/// Parses `-getdnsservers` output into the sentinel or a server list.
pub fn parse_get_dns_servers(text: &str) -> DnsServers {
    let out = text.trim();
    if out.is_empty() || out.contains("There aren't any DNS Servers") {
        return DnsServers::Empty;
    }

    let servers: Vec<String> = out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if servers.is_empty() {
        DnsServers::Empty
    } else {
        DnsServers::Servers(servers)
    }
}

/// Parses `-getsearchdomains` output the same way.
pub fn parse_get_search_domains(text: &str) -> DnsServers {
    let out = text.trim();
    if out.is_empty() || out.contains("There aren't any Search Domains") {
        return DnsServers::Empty;
    }

    let domains: Vec<String> = out
        .lines()
        .map(|l| l.trim().trim_end_matches('.'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if domains.is_empty() {
        DnsServers::Empty
    } else {
        DnsServers::Servers(domains)
    }
}

pub async fn get_dns_servers(service: &str) -> Result<DnsServers> {
    let r = exec::run(NETWORKSETUP, &["-getdnsservers", service], cmd_timeout()).await?;
    if !r.success() {
        return Err(MacblockError::transient(format!(
            "networksetup -getdnsservers {service}: {}",
            r.stderr.trim()
        )));
    }
    Ok(parse_get_dns_servers(&r.stdout))
}

pub async fn get_search_domains(service: &str) -> Result<DnsServers> {
    let r = exec::run(NETWORKSETUP, &["-getsearchdomains", service], cmd_timeout()).await?;
    if !r.success() {
        return Err(MacblockError::transient(format!(
            "networksetup -getsearchdomains {service}: {}",
            r.stderr.trim()
        )));
    }
    Ok(parse_get_search_domains(&r.stdout))
}

async fn set_with(verb: &str, service: &str, value: &DnsServers) -> Result<()> {
    let mut args: Vec<&str> = vec![verb, service];
    match value {
        DnsServers::Empty => args.push("Empty"),
        DnsServers::Servers(list) => args.extend(list.iter().map(String::as_str)),
    }

    let r = exec::run(NETWORKSETUP, &args, cmd_timeout()).await?;
    if !r.success() {
        // networksetup reports most errors on stdout.
        let detail = if r.stderr.trim().is_empty() { r.stdout.trim() } else { r.stderr.trim() };
        return Err(MacblockError::transient(format!(
            "networksetup {verb} {service}: {detail}"
        )));
    }
    Ok(())
}

pub async fn set_dns_servers(service: &str, value: &DnsServers) -> Result<()> {
    set_with("-setdnsservers", service, value).await
}

pub async fn set_search_domains(service: &str, value: &DnsServers) -> Result<()> {
    set_with("-setsearchdomains", service, value).await
}

/// Points `service` at the loopback resolver.
pub async fn apply_loopback(service: &str) -> Result<()> {
    set_dns_servers(service, &DnsServers::Servers(vec![LOOPBACK_DNS.to_string()])).await
}

/// Restores a service from its backup: DNS servers then search domains.
pub async fn restore_from_backup(service: &str, backup: &ServiceBackup) -> Result<()> {
    set_dns_servers(service, &backup.dns).await?;
    set_search_domains(service, &backup.search).await?;
    Ok(())
}

/// Captures the pre-intercept configuration of a service.
pub async fn snapshot_backup(service: &str) -> Result<ServiceBackup> {
    Ok(ServiceBackup {
        dns: get_dns_servers(service).await?,
        search: get_search_domains(service).await?,
    })
}

/// True when the service currently points at the loopback resolver.
pub fn is_loopback(servers: &DnsServers) -> bool {
    matches!(servers, DnsServers::Servers(list) if list.len() == 1 && list[0] == LOOPBACK_DNS)
}

fn is_ipv4(token: &str) -> bool {
    token.parse::<std::net::Ipv4Addr>().is_ok()
}

/// Reads the DHCP-provided nameservers for a device, used to enrich the
/// upstream defaults. Loopback and duplicates are dropped.
pub async fn read_dhcp_nameservers(device: &str) -> Vec<String> {
    if device.is_empty() {
        return Vec::new();
    }
    let r = match exec::run(
        IPCONFIG,
        &["getoption", device, "domain_name_server"],
        cmd_timeout(),
    )
    .await
    {
        Ok(r) if r.success() => r,
        _ => return Vec::new(),
    };

    let mut ips = Vec::new();
    for token in r.stdout.split_whitespace() {
        if is_ipv4(token) && token != LOOPBACK_DNS && !ips.iter().any(|x| x == token) {
            ips.push(token.to_string());
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_dns_servers_sentinel() {
        let text = "There aren't any DNS Servers set on Wi-Fi.\n";
        assert_eq!(parse_get_dns_servers(text), DnsServers::Empty);
        assert_eq!(parse_get_dns_servers(""), DnsServers::Empty);
    }

    #[test]
    fn test_parse_get_dns_servers_list() {
        let text = "8.8.8.8\n1.1.1.1\n";
        assert_eq!(
            parse_get_dns_servers(text),
            DnsServers::Servers(vec!["8.8.8.8".into(), "1.1.1.1".into()])
        );
    }

    #[test]
    fn test_parse_search_domains_strips_trailing_dot() {
        let text = "corp.example.\nhome.arpa\n";
        assert_eq!(
            parse_get_search_domains(text),
            DnsServers::Servers(vec!["corp.example".into(), "home.arpa".into()])
        );
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback(&DnsServers::Servers(vec!["127.0.0.1".into()])));
        assert!(!is_loopback(&DnsServers::Servers(vec![
            "127.0.0.1".into(),
            "8.8.8.8".into()
        ])));
        assert!(!is_loopback(&DnsServers::Empty));
    }
}
