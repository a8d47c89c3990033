//! Install and uninstall of the privileged footprint.
//!
//! Install lays down the dedicated user, root-owned directories, seed config
//! files, the dnsmasq static config and both launchd jobs, then verifies the
//! jobs actually came up. Every step is idempotent or fails naming the step,
//! so a re-run after a partial install converges. Uninstall is the mirror
//! image, best-effort under `--force`, and always ends with a summary of
//! anything it could not remove.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::blocklist::{self, UpdateOptions};
use crate::control;
use crate::dnsmasq;
use crate::error::{MacblockError, Result};
use crate::exec;
use crate::fs::{ensure_dir, write_atomic};
use crate::launchd;
use crate::paths::{daemon_label, dnsmasq_label, Paths, DNSMASQ_USER, LISTEN_ADDR, LISTEN_PORT};
use crate::state::{load_state, save_state, State};
use crate::system_dns;
use crate::upstreams;

const DSCL: &str = "/usr/bin/dscl";
const LSOF: &str = "/usr/sbin/lsof";

const DNSMASQ_CANDIDATES: &[&str] = &[
    "/opt/homebrew/opt/dnsmasq/sbin/dnsmasq",
    "/usr/local/opt/dnsmasq/sbin/dnsmasq",
    "/opt/homebrew/sbin/dnsmasq",
    "/usr/local/sbin/dnsmasq",
];

const SELF_CANDIDATES: &[&str] = &["/opt/homebrew/bin/macblock", "/usr/local/bin/macblock"];

fn find_dnsmasq_bin() -> Result<String> {
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(v) = std::env::var("MACBLOCK_DNSMASQ_BIN") {
        candidates.push(v);
    }
    candidates.extend(DNSMASQ_CANDIDATES.iter().map(|s| s.to_string()));

    candidates
        .into_iter()
        .find(|c| !c.is_empty() && Path::new(c).exists())
        .ok_or_else(|| {
            MacblockError::Platform(
                "dnsmasq is not installed; install with: brew install dnsmasq".to_string(),
            )
        })
}

fn find_self_bin() -> Result<String> {
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(v) = std::env::var("MACBLOCK_BIN") {
        candidates.push(v);
    }
    candidates.extend(SELF_CANDIDATES.iter().map(|s| s.to_string()));

    if let Some(found) = candidates.iter().find(|c| !c.is_empty() && Path::new(c).exists()) {
        return Ok(found.clone());
    }

    let exe = std::env::current_exe()
        .map_err(|e| MacblockError::Platform(format!("cannot locate the macblock binary: {e}")))?;
    Ok(exe.to_string_lossy().into_owned())
}

/// Names the process listening on loopback:53, if any.
async fn port_53_blocker() -> Option<String> {
    let r = exec::run(
        LSOF,
        &["-i", &format!(":{LISTEN_PORT}"), "-P", "-n"],
        Duration::from_secs(10),
    )
    .await
    .ok()?;
    if !r.success() {
        return None;
    }
    // First data row, first column is the command name.
    r.stdout
        .lines()
        .nth(1)
        .and_then(|l| l.split_whitespace().next())
        .map(str::to_string)
}

async fn check_port_available(force: bool) -> Result<()> {
    match TcpListener::bind((LISTEN_ADDR, LISTEN_PORT)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let blocker = port_53_blocker().await.unwrap_or_else(|| "unknown process".to_string());
            if blocker.to_lowercase().contains("dnsmasq") && force {
                // Our own previous install; the bootout below replaces it.
                Ok(())
            } else {
                Err(MacblockError::Conflict(format!(
                    "port {LISTEN_PORT} on {LISTEN_ADDR} is in use by {blocker}; stop it and retry"
                )))
            }
        }
        Err(e) => Err(MacblockError::Conflict(format!(
            "cannot probe {LISTEN_ADDR}:{LISTEN_PORT}: {e}"
        ))),
    }
}

async fn dscl(args: &[&str]) -> Result<exec::RunResult> {
    exec::run(DSCL, args, Duration::from_secs(15)).await
}

async fn user_exists(name: &str) -> bool {
    matches!(dscl(&[".", "-read", &format!("/Users/{name}")]).await, Ok(r) if r.success())
}

async fn used_ids(path: &str, attribute: &str) -> BTreeSet<u32> {
    let mut ids = BTreeSet::new();
    if let Ok(r) = dscl(&[".", "-list", path, attribute]).await {
        if r.success() {
            for line in r.stdout.lines() {
                if let Some(id) = line.split_whitespace().last().and_then(|t| t.parse().ok()) {
                    ids.insert(id);
                }
            }
        }
    }
    ids
}

/// Creates the dedicated unprivileged user and group, idempotently.
async fn ensure_system_user() -> Result<()> {
    if user_exists(DNSMASQ_USER).await {
        return Ok(());
    }

    let used_uids = used_ids("/Users", "UniqueID").await;
    let used_gids = used_ids("/Groups", "PrimaryGroupID").await;
    let id = (200u32..400)
        .find(|id| !used_uids.contains(id) && !used_gids.contains(id))
        .ok_or_else(|| MacblockError::Platform("no free system uid/gid in 200..400".to_string()))?;
    let id_str = id.to_string();

    let group = format!("/Groups/{DNSMASQ_USER}");
    let user = format!("/Users/{DNSMASQ_USER}");
    let steps: &[&[&str]] = &[
        &[".", "-create", &group],
        &[".", "-create", &group, "PrimaryGroupID", &id_str],
        &[".", "-create", &user],
        &[".", "-create", &user, "UserShell", "/usr/bin/false"],
        &[".", "-create", &user, "UniqueID", &id_str],
        &[".", "-create", &user, "PrimaryGroupID", &id_str],
        &[".", "-create", &user, "NFSHomeDirectory", "/var/empty"],
        &[".", "-create", &user, "IsHidden", "1"],
    ];
    for step in steps {
        let r = dscl(step).await?;
        if !r.success() {
            return Err(MacblockError::Platform(format!(
                "creating user {DNSMASQ_USER}: dscl {}: {}",
                step.join(" "),
                r.stderr.trim()
            )));
        }
    }
    Ok(())
}

async fn delete_system_user() -> Result<()> {
    if !user_exists(DNSMASQ_USER).await {
        return Ok(());
    }
    let _ = dscl(&[".", "-delete", &format!("/Users/{DNSMASQ_USER}")]).await;
    let _ = dscl(&[".", "-delete", &format!("/Groups/{DNSMASQ_USER}")]).await;
    Ok(())
}

fn render_plist(label: &str, program_args: &[&str], out_log: &Path, err_log: &Path) -> String {
    let args_xml: String = program_args
        .iter()
        .map(|a| format!("    <string>{a}</string>\n"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
{args_xml}  </array>
  <key>StandardOutPath</key>
  <string>{out}</string>
  <key>StandardErrorPath</key>
  <string>{err}</string>
  <key>WorkingDirectory</key>
  <string>/var/empty</string>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
</dict>
</plist>
"#,
        out = out_log.display(),
        err = err_log.display(),
    )
}

fn seed_if_missing(path: &Path, contents: &str) -> Result<()> {
    if !path.exists() {
        write_atomic(path, contents.as_bytes(), 0o644)?;
    }
    Ok(())
}

async fn wait_for_dnsmasq_listening(timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if std::net::TcpStream::connect((LISTEN_ADDR, LISTEN_PORT)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(200)).await;
    }
    false
}

async fn wait_for_daemon_alive(paths: &Paths, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(pid) = dnsmasq::read_pid_file(&paths.daemon_pid_file()) {
            if dnsmasq::process_alive(pid) {
                return true;
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    false
}

fn log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let tail: Vec<&str> = text.lines().rev().take(lines).collect();
    if tail.is_empty() {
        return None;
    }
    Some(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
}

async fn verify_services(paths: &Paths) -> Vec<String> {
    let mut issues = Vec::new();

    if !wait_for_dnsmasq_listening(Duration::from_secs(5)).await {
        issues.push(format!("dnsmasq not listening on {LISTEN_ADDR}:{LISTEN_PORT}"));
        if let Some(tail) = log_tail(&paths.dnsmasq_err_log(), 5) {
            issues.push(format!("dnsmasq error log:\n{tail}"));
        }
    }
    if !wait_for_daemon_alive(paths, Duration::from_secs(5)).await {
        issues.push("daemon not running (pid file missing or process gone)".to_string());
        if let Some(tail) = log_tail(&paths.daemon_err_log(), 5) {
            issues.push(format!("daemon error log:\n{tail}"));
        }
    }

    issues
}

fn existing_install_artifacts(paths: &Paths) -> Vec<PathBuf> {
    [paths.dnsmasq_conf(), paths.dnsmasq_plist(), paths.daemon_plist()]
        .into_iter()
        .filter(|p| p.exists())
        .collect()
}

async fn bootout_existing(paths: &Paths) {
    for plist in [paths.dnsmasq_plist(), paths.daemon_plist()] {
        if plist.exists() {
            if let Err(e) = launchd::bootout_system(&plist).await {
                warn!("bootout {}: {e}", plist.display());
            }
        }
    }
}

pub async fn do_install(paths: &Paths, force: bool, skip_update: bool) -> Result<()> {
    let existing = existing_install_artifacts(paths);
    if !existing.is_empty() {
        if force {
            println!("existing installation detected - reinstalling");
            bootout_existing(paths).await;
        } else {
            return Err(MacblockError::Conflict(format!(
                "existing installation detected ({}); run: sudo macblock uninstall (or pass --force)",
                existing[0].display()
            )));
        }
    }

    println!("running pre-flight checks...");
    let dnsmasq_bin = find_dnsmasq_bin()?;
    check_port_available(force).await?;
    let self_bin = find_self_bin()?;
    println!("using dnsmasq: {dnsmasq_bin}");
    println!("using macblock: {self_bin}");

    println!("creating system user...");
    ensure_system_user().await?;

    println!("creating directories...");
    ensure_dir(paths.conf_dir(), 0o755)?;
    ensure_dir(paths.run_dir(), 0o755)?;
    ensure_dir(paths.log_dir(), 0o755)?;

    println!("writing configuration files...");
    seed_if_missing(&paths.whitelist_file(), "")?;
    seed_if_missing(&paths.blacklist_file(), "")?;
    seed_if_missing(
        &paths.exclude_services_file(),
        "# One network service name per line (exact match)\n",
    )?;
    seed_if_missing(
        &paths.upstream_fallbacks_file(),
        &upstreams::DEFAULT_FALLBACKS
            .iter()
            .map(|ip| format!("{ip}\n"))
            .collect::<String>(),
    )?;
    seed_if_missing(&paths.blocklist_raw(), "")?;
    seed_if_missing(&paths.blocklist_conf(), "")?;
    seed_if_missing(
        &paths.upstream_conf(),
        &upstreams::DEFAULT_FALLBACKS
            .iter()
            .map(|ip| format!("server={ip}\n"))
            .collect::<String>(),
    )?;
    write_atomic(&paths.dnsmasq_conf(), dnsmasq::render_conf(paths).as_bytes(), 0o644)?;

    if !paths.state_file().exists() {
        save_state(&paths.state_file(), &State::default())?;
    }

    let dnsmasq_plist = render_plist(
        &dnsmasq_label(),
        &[&dnsmasq_bin, "--keep-in-foreground", "-C", &paths.dnsmasq_conf().to_string_lossy()],
        &paths.dnsmasq_out_log(),
        &paths.dnsmasq_err_log(),
    );
    let daemon_plist = render_plist(
        &daemon_label(),
        &[&self_bin, "daemon"],
        &paths.daemon_out_log(),
        &paths.daemon_err_log(),
    );
    write_atomic(&paths.dnsmasq_plist(), dnsmasq_plist.as_bytes(), 0o644)?;
    write_atomic(&paths.daemon_plist(), daemon_plist.as_bytes(), 0o644)?;

    println!("starting launchd services...");
    for (plist, label) in [
        (paths.dnsmasq_plist(), dnsmasq_label()),
        (paths.daemon_plist(), daemon_label()),
    ] {
        launchd::bootstrap_system(&plist).await?;
        launchd::enable_service(&label).await?;
        launchd::kickstart(&label).await?;
    }

    println!("verifying services...");
    let issues = verify_services(paths).await;
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("  {issue}");
        }
        return Err(MacblockError::transient(
            "service verification failed; run 'macblock doctor' for diagnostics",
        ));
    }

    if !skip_update {
        println!("downloading blocklist (this may take a moment)...");
        if let Err(e) = blocklist::update_blocklist(paths, &UpdateOptions::default()).await {
            eprintln!("warning: blocklist download failed: {e}");
            eprintln!("warning: run 'sudo macblock update' to retry");
        }
    }

    control::kick_daemon(paths).await;

    println!("installed macblock {}", env!("CARGO_PKG_VERSION"));
    println!("next: run 'sudo macblock enable' to start blocking");
    Ok(())
}

/// Every file the installer may have created, in removal order.
fn installed_files(paths: &Paths) -> Vec<PathBuf> {
    vec![
        paths.dnsmasq_plist(),
        paths.daemon_plist(),
        paths.dnsmasq_conf(),
        paths.upstream_conf(),
        paths.blocklist_raw(),
        paths.blocklist_conf(),
        paths.dnsmasq_pid_file(),
        paths.daemon_pid_file(),
        paths.daemon_ready_file(),
        paths.daemon_last_apply_file(),
        paths.state_file(),
        paths.whitelist_file(),
        paths.blacklist_file(),
        paths.exclude_services_file(),
        paths.upstream_fallbacks_file(),
        paths.lock_file(),
        paths.daemon_out_log(),
        paths.daemon_err_log(),
        paths.dnsmasq_out_log(),
        paths.dnsmasq_err_log(),
        paths.dnsmasq_facility_log(),
    ]
}

async fn restore_all_backups(paths: &Paths, failures: &mut Vec<String>) {
    let state = match load_state(&paths.state_file()) {
        Ok(st) => st,
        Err(e) => {
            failures.push(format!("state unreadable, DNS not restored: {e}"));
            return;
        }
    };
    for (service, backup) in &state.dns_backup {
        if let Err(e) = system_dns::restore_from_backup(service, backup).await {
            failures.push(format!("{service}: {e}"));
        }
    }
}

pub async fn do_uninstall(paths: &Paths, force: bool) -> Result<i32> {
    let mut leftovers: Vec<String> = Vec::new();
    let mut restore_failures: Vec<String> = Vec::new();

    restore_all_backups(paths, &mut restore_failures).await;
    if !restore_failures.is_empty() && !force {
        return Err(MacblockError::PartialFailure { failures: restore_failures });
    }

    for plist in [paths.dnsmasq_plist(), paths.daemon_plist()] {
        if !plist.exists() {
            continue;
        }
        if let Err(e) = launchd::bootout_system(&plist).await {
            if force {
                warn!("bootout {}: {e}", plist.display());
            } else {
                return Err(e);
            }
        }
    }

    for file in installed_files(paths) {
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                if force {
                    leftovers.push(file.display().to_string());
                    warn!("removing {}: {e}", file.display());
                } else {
                    return Err(MacblockError::TransientIo(format!(
                        "removing {}: {e}",
                        file.display()
                    )));
                }
            }
        }
    }

    for dir in [paths.run_dir(), paths.conf_dir(), paths.log_dir()] {
        let _ = std::fs::remove_dir(dir);
    }

    if force {
        delete_system_user().await?;
    }

    for label in [dnsmasq_label(), daemon_label()] {
        if launchd::service_exists(&label).await {
            leftovers.push(format!("launchd {label}"));
        }
    }

    for failure in &restore_failures {
        eprintln!("warning: DNS restore: {failure}");
    }

    if leftovers.is_empty() {
        println!("uninstalled");
        Ok(0)
    } else {
        println!("uninstall incomplete; left behind:");
        for item in &leftovers {
            println!("  {item}");
        }
        Ok(1)
    }
}
