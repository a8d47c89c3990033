//! Resolver control: static config, liveness and reload.
//!
//! dnsmasq runs as its own launchd job; we only ever write its config files
//! and signal it. A reload is SIGHUP by pid file; dnsmasq re-reads both the
//! servers file and the blocklist include on HUP per the config contract.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::dns_test::{query_loopback, QueryOutcome};
use crate::error::{MacblockError, Result};
use crate::paths::{Paths, DNSMASQ_USER, LISTEN_ADDR, LISTEN_ADDR_V6, LISTEN_PORT};

/// Renders the static dnsmasq configuration laid down at install.
pub fn render_conf(paths: &Paths) -> String {
    let lines = [
        "keep-in-foreground".to_string(),
        format!("listen-address={LISTEN_ADDR}"),
        format!("listen-address={LISTEN_ADDR_V6}"),
        format!("port={LISTEN_PORT}"),
        "bind-interfaces".to_string(),
        format!("user={DNSMASQ_USER}"),
        "no-resolv".to_string(),
        "no-hosts".to_string(),
        "domain-needed".to_string(),
        "bogus-priv".to_string(),
        "cache-size=10000".to_string(),
        format!("log-facility={}", paths.dnsmasq_facility_log().display()),
        format!("pid-file={}", paths.dnsmasq_pid_file().display()),
        format!("servers-file={}", paths.upstream_conf().display()),
        format!("conf-file={}", paths.blocklist_conf().display()),
    ];
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Reads a single-integer pid file. Pid 0/1 and garbage count as absent.
pub fn read_pid_file(path: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    let pid: i32 = text.trim().parse().ok()?;
    (pid > 1).then_some(pid)
}

/// Signal-0 liveness probe. EPERM means alive but not ours.
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Signals dnsmasq to reload its config files.
///
/// # Errors
///
/// A missing pid file or a stale pid is a retryable [`TransientIo`] failure;
/// the caller decides whether to kickstart the job instead.
pub async fn reload(paths: &Paths) -> Result<()> {
    let pid_path = paths.dnsmasq_pid_file();
    let Some(pid) = read_pid_file(&pid_path) else {
        return Err(MacblockError::transient(format!(
            "dnsmasq not running (no pid in {})",
            pid_path.display()
        )));
    };

    match kill(Pid::from_raw(pid), Signal::SIGHUP) {
        Ok(()) => {
            debug!("sent SIGHUP to dnsmasq (pid {pid})");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            // Leave the stale file for dnsmasq to replace on restart.
            Err(MacblockError::transient(format!("stale dnsmasq pid {pid}")))
        }
        Err(e) => Err(MacblockError::transient(format!("signalling dnsmasq pid {pid}: {e}"))),
    }
}

/// Best-effort post-reload probe: a known-blocked name must come back
/// NXDOMAIN. Failures are reported, never fatal; the reload already
/// happened.
pub async fn verify_canary(blocklist_raw: &Path) -> Result<()> {
    let Some(domain) = first_domain(blocklist_raw) else {
        debug!("no compiled domains; skipping canary");
        return Ok(());
    };

    match query_loopback(&domain).await {
        QueryOutcome::Blocked(_) => {
            debug!("canary {domain} is blocked as expected");
            Ok(())
        }
        QueryOutcome::Allowed(ips) => Err(MacblockError::transient(format!(
            "canary {domain} resolved to {ips:?} instead of NXDOMAIN"
        ))),
        QueryOutcome::Error(msg) => Err(MacblockError::transient(format!("canary {domain}: {msg}"))),
    }
}

fn first_domain(blocklist_raw: &Path) -> Option<String> {
    let text = std::fs::read_to_string(blocklist_raw).ok()?;
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Whether the dnsmasq job looks alive from its pid file.
pub fn is_running(paths: &Paths) -> bool {
    match read_pid_file(&paths.dnsmasq_pid_file()) {
        Some(pid) => process_alive(pid),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;

    #[test]
    fn test_render_conf_wires_the_contract_paths() {
        let paths = Paths::rooted(Path::new("/tmp/mb"));
        let conf = render_conf(&paths);
        assert!(conf.contains("listen-address=127.0.0.1"));
        assert!(conf.contains("port=53"));
        assert!(conf.contains(&format!("user={DNSMASQ_USER}")));
        assert!(conf.contains("servers-file=/tmp/mb/run/upstream.conf"));
        assert!(conf.contains("conf-file=/tmp/mb/run/blocklist.conf"));
        assert!(conf.ends_with('\n'));
    }

    #[test]
    fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.pid");

        assert_eq!(read_pid_file(&path), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));

        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(read_pid_file(&path), None);

        std::fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[tokio::test]
    async fn test_reload_without_pid_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(dir.path());
        let err = reload(&paths).await.unwrap_err();
        assert!(matches!(err, MacblockError::TransientIo(_)));
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn test_first_domain_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.raw");
        std::fs::write(&path, "\n\nads.example\nmore.example\n").unwrap();
        assert_eq!(first_domain(&path), Some("ads.example".to_string()));
    }
}
