//! Canonical on-disk layout and process-wide constants.
//!
//! Every file name below is a compatibility contract shared between the CLI,
//! the daemon and dnsmasq; diagnostics and the uninstaller walk the same
//! paths. Tests construct a [`Paths`] rooted in a temp directory instead of
//! touching the system locations.

use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "macblock";
pub const APP_LABEL: &str = "com.local.macblock";

/// Unprivileged user dnsmasq drops to after binding port 53.
pub const DNSMASQ_USER: &str = "_macblockd";

pub const LISTEN_ADDR: &str = "127.0.0.1";
pub const LISTEN_ADDR_V6: &str = "::1";
pub const LISTEN_PORT: u16 = 53;

pub const RECONCILE_TICK_SECS: u64 = 30;
pub const READINESS_GATE_SECS: u64 = 15;
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Marker variable set across the sudo re-exec to stop recursion.
pub const REEXEC_ENV: &str = "MACBLOCK_REEXEC";

/// Root directories for everything macblock touches.
///
/// `system()` is the real host layout; `rooted()` relocates the whole tree
/// under an arbitrary prefix for tests.
#[derive(Debug, Clone)]
pub struct Paths {
    conf_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    launch_dir: PathBuf,
}

impl Paths {
    pub fn system() -> Self {
        Self {
            conf_dir: PathBuf::from("/Library/Application Support").join(APP_NAME),
            run_dir: PathBuf::from("/var/db").join(APP_NAME),
            log_dir: PathBuf::from("/Library/Logs").join(APP_NAME),
            launch_dir: PathBuf::from("/Library/LaunchDaemons"),
        }
    }

    pub fn rooted(root: &Path) -> Self {
        Self {
            conf_dir: root.join("conf"),
            run_dir: root.join("run"),
            log_dir: root.join("log"),
            launch_dir: root.join("launch"),
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    // <CONF>: control-plane owned.

    pub fn state_file(&self) -> PathBuf {
        self.conf_dir.join("state.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.conf_dir.join(".lock")
    }

    pub fn whitelist_file(&self) -> PathBuf {
        self.conf_dir.join("whitelist.txt")
    }

    pub fn blacklist_file(&self) -> PathBuf {
        self.conf_dir.join("blacklist.txt")
    }

    pub fn exclude_services_file(&self) -> PathBuf {
        self.conf_dir.join("dns.exclude_services")
    }

    pub fn upstream_fallbacks_file(&self) -> PathBuf {
        self.conf_dir.join("upstream.fallbacks")
    }

    pub fn dnsmasq_conf(&self) -> PathBuf {
        self.conf_dir.join("dnsmasq.conf")
    }

    // <RUN>: daemon / dnsmasq owned.

    pub fn upstream_conf(&self) -> PathBuf {
        self.run_dir.join("upstream.conf")
    }

    pub fn blocklist_raw(&self) -> PathBuf {
        self.run_dir.join("blocklist.raw")
    }

    pub fn blocklist_conf(&self) -> PathBuf {
        self.run_dir.join("blocklist.conf")
    }

    pub fn daemon_pid_file(&self) -> PathBuf {
        self.run_dir.join("daemon.pid")
    }

    pub fn daemon_ready_file(&self) -> PathBuf {
        self.run_dir.join("daemon.ready")
    }

    pub fn daemon_last_apply_file(&self) -> PathBuf {
        self.run_dir.join("daemon.last_apply")
    }

    pub fn dnsmasq_pid_file(&self) -> PathBuf {
        self.run_dir.join("dnsmasq.pid")
    }

    // <LOG>: launchd redirect targets plus the dnsmasq facility log.

    pub fn daemon_out_log(&self) -> PathBuf {
        self.log_dir.join("daemon.out.log")
    }

    pub fn daemon_err_log(&self) -> PathBuf {
        self.log_dir.join("daemon.err.log")
    }

    pub fn dnsmasq_out_log(&self) -> PathBuf {
        self.log_dir.join("dnsmasq.out.log")
    }

    pub fn dnsmasq_err_log(&self) -> PathBuf {
        self.log_dir.join("dnsmasq.err.log")
    }

    pub fn dnsmasq_facility_log(&self) -> PathBuf {
        self.log_dir.join("dnsmasq.log")
    }

    // <LAUNCH>

    pub fn daemon_plist(&self) -> PathBuf {
        self.launch_dir.join(format!("{APP_LABEL}.daemon.plist"))
    }

    pub fn dnsmasq_plist(&self) -> PathBuf {
        self.launch_dir.join(format!("{APP_LABEL}.dnsmasq.plist"))
    }
}

pub fn daemon_label() -> String {
    format!("{APP_LABEL}.daemon")
}

pub fn dnsmasq_label() -> String {
    format!("{APP_LABEL}.dnsmasq")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_layout_file_names() {
        let p = Paths::system();
        assert_eq!(
            p.state_file(),
            PathBuf::from("/Library/Application Support/macblock/state.json")
        );
        assert_eq!(p.upstream_conf(), PathBuf::from("/var/db/macblock/upstream.conf"));
        assert_eq!(
            p.daemon_plist(),
            PathBuf::from("/Library/LaunchDaemons/com.local.macblock.daemon.plist")
        );
    }

    #[test]
    fn test_rooted_layout_stays_under_root() {
        let p = Paths::rooted(Path::new("/tmp/x"));
        assert!(p.blocklist_conf().starts_with("/tmp/x"));
        assert!(p.daemon_ready_file().starts_with("/tmp/x"));
    }
}
