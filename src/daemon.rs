//! The reconciliation daemon.
//!
//! One single-threaded event loop multiplexing the network-change bus,
//! control signals, a pause-expiry timer and a coarse safety-net tick. Every
//! wakeup sets a dirty flag and funnels into the same reconcile pass, so
//! concurrent triggers coalesce and at most one reconcile is ever in flight.
//!
//! A reconcile makes the host match the state record: capture-then-override
//! when blocking is on, restore-then-forget when it is off, and in either
//! case re-derive dnsmasq's upstream rules from the live resolver table.
//! Failures are counted across passes; too many in a row exits the process
//! so launchd restarts it and the fault becomes visible.

use std::collections::BTreeSet;
use std::process;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dnsmasq;
use crate::error::{MacblockError, Result};
use crate::exec;
use crate::fs::write_atomic;
use crate::paths::{Paths, MAX_CONSECUTIVE_FAILURES, READINESS_GATE_SECS, RECONCILE_TICK_SECS};
use crate::resolvers;
use crate::services::{self, ServiceInfo};
use crate::state::{load_state, lock_state_dir, now_epoch, save_state, State};
use crate::system_dns;
use crate::upstreams;

const NOTIFYUTIL: &str = "/usr/bin/notifyutil";
const NETWORK_CHANGE_KEY: &str = "com.apple.system.config.network_change";
const ROUTE: &str = "/sbin/route";

/// Outcome of one reconcile pass.
#[derive(Debug, Default)]
struct ApplyReport {
    issues: Vec<String>,
    /// Seconds until the pause-expiry timer should fire, if a pause is set.
    resume_in: Option<u64>,
}

fn write_marker(path: &std::path::Path, value: i64) {
    if let Err(e) = write_atomic(path, format!("{value}\n").as_bytes(), 0o644) {
        warn!("writing {}: {e}", path.display());
    }
}

fn remove_marker(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("removing {}: {e}", path.display());
        }
    }
}

/// Refuses to start when another daemon owns the pid file; cleans up stale
/// markers from a dead one.
fn check_stale_daemon(paths: &Paths) -> Result<()> {
    let Some(pid) = dnsmasq::read_pid_file(&paths.daemon_pid_file()) else {
        return Ok(());
    };
    if pid == process::id() as i32 {
        return Ok(());
    }
    if dnsmasq::process_alive(pid) {
        return Err(MacblockError::Conflict(format!(
            "another macblock daemon is already running (pid {pid})"
        )));
    }
    info!("removing stale daemon markers (pid {pid} is gone)");
    remove_marker(&paths.daemon_pid_file());
    remove_marker(&paths.daemon_ready_file());
    Ok(())
}

/// True when the host has a default route on either family.
async fn default_route_known() -> bool {
    for args in [&["-n", "get", "default"][..], &["-n", "get", "-inet6", "default"][..]] {
        if let Ok(r) = exec::run(ROUTE, args, Duration::from_secs(5)).await {
            if r.success() && r.stdout.contains("interface:") {
                return true;
            }
        }
    }
    false
}

/// Bounded wait for a default route before applying an "on" state, so we
/// don't capture DNS mid-transition. Applies anyway on timeout.
async fn readiness_gate() {
    let deadline = Instant::now() + Duration::from_secs(READINESS_GATE_SECS);
    loop {
        if default_route_known().await {
            return;
        }
        if Instant::now() >= deadline {
            warn!("no default route after {READINESS_GATE_SECS}s; applying anyway");
            return;
        }
        sleep(Duration::from_secs(1)).await;
    }
}

/// All enabled service names on the host, unfiltered. Used to tell a service
/// that vanished from the host apart from one we merely stopped managing.
async fn present_service_names() -> BTreeSet<String> {
    match exec::run(
        "/usr/sbin/networksetup",
        &["-listallnetworkservices"],
        Duration::from_secs(10),
    )
    .await
    {
        Ok(r) if r.success() => services::parse_service_list(&r.stdout).into_iter().collect(),
        _ => BTreeSet::new(),
    }
}

/// Restores every service we stopped managing but which is still present;
/// vanished services keep their backup until they reappear.
async fn release_unmanaged(
    state: &mut State,
    managed: &[ServiceInfo],
    present: &BTreeSet<String>,
    issues: &mut Vec<String>,
) {
    let managed_names: BTreeSet<String> = managed.iter().map(|i| i.name.clone()).collect();

    for name in state.managed_services.clone() {
        if managed_names.contains(&name) {
            continue;
        }
        state.managed_services.remove(&name);

        if !present.contains(&name) {
            debug!("{name} vanished from host; keeping its backup");
            continue;
        }
        let Some(backup) = state.dns_backup.get(&name).cloned() else {
            continue;
        };
        match system_dns::restore_from_backup(&name, &backup).await {
            Ok(()) => {
                state.dns_backup.remove(&name);
                info!("released {name} from management");
            }
            Err(e) => issues.push(format!("{name}: restore failed: {e}")),
        }
    }
}

async fn capture_backups(state: &mut State, managed: &[ServiceInfo], issues: &mut Vec<String>) {
    for info in managed {
        if state.dns_backup.contains_key(&info.name) {
            continue;
        }
        match system_dns::snapshot_backup(&info.name).await {
            Ok(backup) => {
                if system_dns::is_loopback(&backup.dns) {
                    // Already pointing at us, presumably from a previous run
                    // whose backup was lost; nothing original left to save.
                    continue;
                }
                state.dns_backup.insert(info.name.clone(), backup);
            }
            Err(e) => issues.push(format!("{}: backup failed: {e}", info.name)),
        }
    }
}

async fn apply_overrides(state: &mut State, managed: &[ServiceInfo], issues: &mut Vec<String>) {
    for info in managed {
        match system_dns::apply_loopback(&info.name).await {
            Ok(()) => {
                state.managed_services.insert(info.name.clone());
            }
            Err(e) => issues.push(format!("{}: set failed: {e}", info.name)),
        }
    }
}

async fn disable_blocking(state: &mut State, present: &BTreeSet<String>, issues: &mut Vec<String>) {
    for (name, backup) in state.dns_backup.clone() {
        if !present.contains(&name) {
            continue;
        }
        match system_dns::restore_from_backup(&name, &backup).await {
            Ok(()) => {
                state.dns_backup.remove(&name);
                state.managed_services.remove(&name);
            }
            Err(e) => issues.push(format!("{name}: restore failed: {e}")),
        }
    }
}

/// Post-apply check: each managed service must (or must not) point at
/// loopback.
async fn verify_applied(managed: &[ServiceInfo], expect_loopback: bool, issues: &mut Vec<String>) {
    for info in managed {
        let current = match system_dns::get_dns_servers(&info.name).await {
            Ok(c) => c,
            Err(e) => {
                issues.push(format!("{}: verify failed: {e}", info.name));
                continue;
            }
        };
        let at_loopback = system_dns::is_loopback(&current);
        if expect_loopback && !at_loopback {
            issues.push(format!("{}: expected loopback DNS, got {current:?}", info.name));
        } else if !expect_loopback && at_loopback {
            issues.push(format!("{}: still pointing at loopback", info.name));
        }
    }
}

/// Persists the daemon-owned fields (backups, managed set, expired-pause
/// clear) without clobbering concurrent control-plane edits: the record is
/// re-read under the lock and only our fields are merged in. No subprocess
/// runs while the lock is held.
fn persist_daemon_fields(paths: &Paths, state: &State) -> Result<()> {
    let _lock = lock_state_dir(paths)?;
    let mut fresh = load_state(&paths.state_file())?;
    fresh.dns_backup = state.dns_backup.clone();
    fresh.managed_services = state.managed_services.clone();
    fresh.clear_expired_pause(now_epoch());
    save_state(&paths.state_file(), &fresh)
}

async fn reconcile(paths: &Paths) -> Result<ApplyReport> {
    let mut state = load_state(&paths.state_file())?;
    let mut report = ApplyReport::default();
    let now = now_epoch();

    if state.clear_expired_pause(now) {
        info!("pause expired; resuming blocking");
    }
    let effective_on = state.effective_on(now);

    if effective_on {
        readiness_gate().await;
    }

    let exclude = services::load_exclude_set(&paths.exclude_services_file());
    let managed = services::compute_managed_services(&exclude).await?;
    let present = present_service_names().await;

    release_unmanaged(&mut state, &managed, &present, &mut report.issues).await;

    if effective_on {
        // Backups must be durable before the first override of a service.
        capture_backups(&mut state, &managed, &mut report.issues).await;
        persist_daemon_fields(paths, &state)?;
        apply_overrides(&mut state, &managed, &mut report.issues).await;
    } else {
        disable_blocking(&mut state, &present, &mut report.issues).await;
    }

    persist_daemon_fields(paths, &state)?;

    let table = resolvers::read_system_resolvers().await?;
    upstreams::write_upstream_conf(
        &paths.upstream_conf(),
        &paths.upstream_fallbacks_file(),
        &table,
        &managed,
        &state,
    )
    .await?;

    if let Err(e) = dnsmasq::reload(paths).await {
        report.issues.push(format!("dnsmasq reload: {e}"));
    }

    verify_applied(&managed, effective_on, &mut report.issues).await;

    write_marker(&paths.daemon_last_apply_file(), now_epoch());
    report.resume_in = state.seconds_until_resume(now_epoch());
    Ok(report)
}

/// Spawns the network-change watcher: a long-lived notifyutil child whose
/// stdout lines become events. Restarts the child with backoff; if it cannot
/// start at all the daemon degrades to tick-only operation.
fn spawn_network_watcher(tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        let mut warned = false;
        loop {
            let child = tokio::process::Command::new(NOTIFYUTIL)
                .args(["-w", NETWORK_CHANGE_KEY])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn();

            let mut child = match child {
                Ok(c) => c,
                Err(e) => {
                    if !warned {
                        warn!("cannot start notifyutil ({e}); relying on periodic tick");
                        warned = true;
                    }
                    sleep(Duration::from_secs(30)).await;
                    continue;
                }
            };

            if let Some(stdout) = child.stdout.take() {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(_)) = lines.next_line().await {
                    debug!("network change notification");
                    if tx.send(()).await.is_err() {
                        return;
                    }
                }
            }

            let _ = child.wait().await;
            sleep(Duration::from_secs(1)).await;
        }
    });
}

/// Daemon entry point. Returns the process exit code.
pub async fn run_daemon(paths: &Paths) -> Result<i32> {
    check_stale_daemon(paths)?;

    // Sweep temp files a crashed writer may have left next to our outputs.
    for dir in [paths.run_dir(), paths.conf_dir()] {
        let _ = crate::fs::remove_stale_temps(dir);
    }

    let mut sigusr1 = signal(SignalKind::user_defined1())
        .map_err(|e| MacblockError::transient(format!("installing SIGUSR1 handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| MacblockError::transient(format!("installing SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| MacblockError::transient(format!("installing SIGINT handler: {e}")))?;

    let (net_tx, mut net_rx) = mpsc::channel::<()>(8);
    spawn_network_watcher(net_tx);

    let mut tick = interval(Duration::from_secs(RECONCILE_TICK_SECS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    write_marker(&paths.daemon_pid_file(), i64::from(process::id()));
    info!("macblock daemon started (pid {})", process::id());

    let mut dirty = true;
    let mut consecutive_failures: u32 = 0;
    let mut resume_in: Option<u64> = None;
    let exit_code;

    loop {
        if dirty {
            dirty = false;
            match reconcile(paths).await {
                Ok(report) => {
                    resume_in = report.resume_in;
                    if report.issues.is_empty() {
                        consecutive_failures = 0;
                        if !paths.daemon_ready_file().exists() {
                            write_marker(&paths.daemon_ready_file(), now_epoch());
                            info!("daemon ready");
                        }
                    } else {
                        consecutive_failures += 1;
                        for issue in &report.issues {
                            warn!("apply issue: {issue}");
                        }
                    }
                }
                Err(e @ MacblockError::StateCorrupt(_)) => {
                    // A corrupt record must never drive DNS changes; bail and
                    // let launchd surface the restart loop.
                    error!("{e}");
                    exit_code = 1;
                    break;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!("reconcile failed: {e}");
                }
            }

            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                error!("{consecutive_failures} consecutive reconcile failures; exiting for restart");
                exit_code = 1;
                break;
            }
        }

        let pause_timer = async {
            match resume_in {
                Some(secs) => sleep(Duration::from_secs(secs.max(1))).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = sigusr1.recv() => {
                debug!("SIGUSR1: reconcile requested");
                dirty = true;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down");
                exit_code = 0;
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT: shutting down");
                exit_code = 0;
                break;
            }
            _ = net_rx.recv() => {
                dirty = true;
            }
            _ = tick.tick() => {
                dirty = true;
            }
            _ = pause_timer => {
                info!("pause timer fired");
                resume_in = None;
                dirty = true;
            }
        }
    }

    // Markers go away; DNS stays as-is. Undoing the intercept is an explicit
    // `disable`/`uninstall` decision, not a side effect of a restart.
    remove_marker(&paths.daemon_ready_file());
    remove_marker(&paths.daemon_pid_file());
    info!("daemon stopped");
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DnsServers, ServiceBackup};

    #[test]
    fn test_marker_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("daemon.ready");

        write_marker(&marker, 1234);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "1234\n");

        remove_marker(&marker);
        assert!(!marker.exists());
        // Removing twice is quiet.
        remove_marker(&marker);
    }

    #[test]
    fn test_stale_daemon_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(dir.path());
        std::fs::create_dir_all(paths.run_dir()).unwrap();

        // A pid that cannot be alive: far beyond pid_max.
        std::fs::write(paths.daemon_pid_file(), "99999999\n").unwrap();
        std::fs::write(paths.daemon_ready_file(), "1\n").unwrap();

        check_stale_daemon(&paths).unwrap();
        assert!(!paths.daemon_pid_file().exists());
        assert!(!paths.daemon_ready_file().exists());
    }

    #[test]
    fn test_stale_daemon_refuses_live_pid() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(dir.path());
        std::fs::create_dir_all(paths.run_dir()).unwrap();

        // pid 2+ of the test runner's own process tree: use our parent.
        let live = std::os::unix::process::parent_id();
        if live > 1 {
            std::fs::write(paths.daemon_pid_file(), format!("{live}\n")).unwrap();
            let err = check_stale_daemon(&paths).unwrap_err();
            assert!(matches!(err, MacblockError::Conflict(_)));
        }
    }

    #[tokio::test]
    async fn test_release_unmanaged_keeps_backup_of_vanished_service() {
        let mut state = State::default();
        state.managed_services.insert("Ethernet".to_string());
        state.dns_backup.insert(
            "Ethernet".to_string(),
            ServiceBackup { dns: DnsServers::Servers(vec!["8.8.8.8".into()]), search: DnsServers::Empty },
        );

        let managed: Vec<ServiceInfo> = Vec::new();
        let present: BTreeSet<String> = BTreeSet::new();
        let mut issues = Vec::new();

        release_unmanaged(&mut state, &managed, &present, &mut issues).await;

        assert!(issues.is_empty());
        assert!(!state.managed_services.contains("Ethernet"));
        assert!(state.dns_backup.contains_key("Ethernet"));
    }
}
