//! Read-only diagnostics: `status` and `doctor`.
//!
//! Neither command mutates state, markers or DNS. Missing or malformed
//! marker files are reported, not fatal.

use std::path::Path;

use crate::dnsmasq;
use crate::error::Result;
use crate::exec;
use crate::paths::{Paths, APP_LABEL, LISTEN_PORT, RECONCILE_TICK_SECS};
use crate::state::{load_state, now_epoch};
use crate::system_dns;

fn read_epoch(path: &Path) -> Option<i64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn describe_epoch(epoch: Option<i64>) -> String {
    let now = now_epoch();
    match epoch {
        None => "-".to_string(),
        Some(t) if t <= now => format!("{t} ({}s ago)", now - t),
        Some(t) => format!("{t} (in {}s)", t - now),
    }
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "missing"
    }
}

pub async fn show_status(paths: &Paths) -> Result<i32> {
    let state = load_state(&paths.state_file())?;
    let now = now_epoch();

    println!("macblock status");
    println!("label: {APP_LABEL}");
    println!("enabled: {}", state.enabled);
    println!(
        "effective: {}",
        if state.effective_on(now) { "on" } else { "off" }
    );
    println!("paused_until: {}", describe_epoch(state.paused_until));
    println!("source: {}", state.source.as_deref().unwrap_or("(default)"));
    println!("last_update_at: {}", describe_epoch(state.last_update_at));

    for (name, path) in [
        ("dnsmasq.conf", paths.dnsmasq_conf()),
        ("upstream.conf", paths.upstream_conf()),
        ("blocklist.conf", paths.blocklist_conf()),
        ("plist daemon", paths.daemon_plist()),
        ("plist dnsmasq", paths.dnsmasq_plist()),
    ] {
        println!("{name}: {} ({})", mark(path.exists()), path.display());
    }

    println!("daemon.ready: {}", describe_epoch(read_epoch(&paths.daemon_ready_file())));
    println!(
        "daemon.last_apply: {}",
        describe_epoch(read_epoch(&paths.daemon_last_apply_file()))
    );

    if !state.managed_services.is_empty() {
        println!();
        println!("managed services:");
        for service in &state.managed_services {
            let current = match system_dns::get_dns_servers(service).await {
                Ok(crate::state::DnsServers::Empty) => "dhcp".to_string(),
                Ok(crate::state::DnsServers::Servers(list)) => list.join(", "),
                Err(_) => "(unreadable)".to_string(),
            };
            println!("  {service}: {current}");
        }
    }

    println!();
    println!(
        "dnsmasq: {}",
        if dnsmasq::is_running(paths) { "running" } else { "not running" }
    );
    let daemon_alive = dnsmasq::read_pid_file(&paths.daemon_pid_file())
        .is_some_and(dnsmasq::process_alive);
    println!("daemon: {}", if daemon_alive { "running" } else { "not running" });

    Ok(0)
}

const REQUIRED_BINARIES: &[&str] = &[
    "/usr/sbin/networksetup",
    "/usr/sbin/scutil",
    "/bin/launchctl",
    "/sbin/route",
    "/usr/bin/notifyutil",
];

pub async fn run_doctor(paths: &Paths) -> Result<i32> {
    println!("macblock doctor");
    let mut ok_all = true;

    for bin in REQUIRED_BINARIES {
        let ok = Path::new(bin).exists();
        ok_all &= ok;
        println!("binary {bin}: {}", mark(ok));
    }

    match load_state(&paths.state_file()) {
        Ok(_) => println!("state: ok"),
        Err(e) => {
            ok_all = false;
            println!("state: {e}");
        }
    }

    for (name, path) in [
        ("dnsmasq.conf", paths.dnsmasq_conf()),
        ("blocklist.raw", paths.blocklist_raw()),
        ("blocklist.conf", paths.blocklist_conf()),
        ("upstream.conf", paths.upstream_conf()),
        ("upstream.fallbacks", paths.upstream_fallbacks_file()),
        ("plist daemon", paths.daemon_plist()),
        ("plist dnsmasq", paths.dnsmasq_plist()),
    ] {
        let ok = path.exists();
        ok_all &= ok;
        println!("{name}: {} ({})", mark(ok), path.display());
    }

    let dnsmasq_up = dnsmasq::is_running(paths);
    ok_all &= dnsmasq_up;
    println!("dnsmasq: {}", if dnsmasq_up { "running" } else { "not running" });

    let daemon_up = dnsmasq::read_pid_file(&paths.daemon_pid_file())
        .is_some_and(dnsmasq::process_alive);
    ok_all &= daemon_up;
    println!("daemon: {}", if daemon_up { "running" } else { "not running" });

    match read_epoch(&paths.daemon_last_apply_file()) {
        Some(t) => {
            let age = now_epoch() - t;
            let stale = age > 2 * RECONCILE_TICK_SECS as i64;
            if stale {
                ok_all = false;
            }
            println!("last apply: {age}s ago{}", if stale { " (stale)" } else { "" });
        }
        None => println!("last apply: never"),
    }

    // Who actually answers on :53.
    if let Ok(r) = exec::run(
        "/usr/sbin/lsof",
        &["-i", &format!(":{LISTEN_PORT}"), "-P", "-n"],
        std::time::Duration::from_secs(10),
    )
    .await
    {
        if let Some(row) = r.stdout.lines().nth(1) {
            let owner = row.split_whitespace().next().unwrap_or("unknown");
            println!("port {LISTEN_PORT}: {owner}");
            if !owner.to_lowercase().contains("dnsmasq") {
                ok_all = false;
                println!("  warning: port {LISTEN_PORT} is held by a foreign process");
            }
        } else {
            println!("port {LISTEN_PORT}: nothing listening");
        }
    }

    if let Ok(r) = exec::run("/sbin/ifconfig", &["-l"], std::time::Duration::from_secs(10)).await {
        let vpn_ifaces: Vec<&str> = r
            .stdout
            .split_whitespace()
            .filter(|x| x.starts_with("utun") || x.starts_with("ppp"))
            .collect();
        if !vpn_ifaces.is_empty() {
            println!(
                "note: VPN interfaces present ({}); their services are never managed. \
                 Use {} to exclude more.",
                vpn_ifaces.join(", "),
                paths.exclude_services_file().display()
            );
        }
    }

    println!("label: {APP_LABEL}");
    Ok(i32::from(!ok_all))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_epoch() {
        assert_eq!(describe_epoch(None), "-");
        let now = now_epoch();
        assert!(describe_epoch(Some(now - 10)).contains("ago"));
        assert!(describe_epoch(Some(now + 100)).contains("in "));
    }

    #[test]
    fn test_read_epoch_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.ready");
        assert_eq!(read_epoch(&path), None);
        std::fs::write(&path, "garbage\n").unwrap();
        assert_eq!(read_epoch(&path), None);
        std::fs::write(&path, "1700000000\n").unwrap();
        assert_eq!(read_epoch(&path), Some(1_700_000_000));
    }
}
