//! Control plane: the short-lived command surface.
//!
//! Commands mutate the state record under an advisory lock on the config
//! directory, kick the daemon with SIGUSR1, then confirm the host actually
//! converged before reporting success. The lock only serializes concurrent
//! CLI invocations; the daemon coordinates through the state file itself.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::blocklist;
use crate::dnsmasq;
use crate::error::{MacblockError, Result};
use crate::launchd;
use crate::lists;
use crate::paths::{daemon_label, Paths};
use crate::services;
use crate::state::{load_state, lock_state_dir, now_epoch, save_state, State};
use crate::system_dns;
use crate::upstreams;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Parses a pause duration matching `^\d+(s|m|h|d)$`.
pub fn parse_duration_secs(value: &str) -> Result<u64> {
    let v = value.trim();
    let invalid = || MacblockError::user(format!("invalid duration {value:?}; expected e.g. 30s, 10m, 2h, 1d"));

    if v.len() < 2 || !v.is_ascii() {
        return Err(invalid());
    }
    let (num, unit) = v.split_at(v.len() - 1);
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let n: u64 = num.parse().map_err(|_| invalid())?;
    let mult = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    n.checked_mul(mult).ok_or_else(invalid)
}

/// Mutates the state record under the lock; the write lands before the
/// daemon is signalled.
fn mutate_state(paths: &Paths, f: impl FnOnce(&mut State)) -> Result<State> {
    let _lock = lock_state_dir(paths)?;
    let mut state = load_state(&paths.state_file())?;
    f(&mut state);
    save_state(&paths.state_file(), &state)?;
    Ok(state)
}

fn check_installed(paths: &Paths) -> Result<()> {
    if !paths.dnsmasq_plist().exists() || !paths.daemon_plist().exists() {
        return Err(MacblockError::user(
            "macblock is not installed; run: sudo macblock install",
        ));
    }
    Ok(())
}

/// Sends SIGUSR1 to a live daemon. Returns false when there is none.
pub fn signal_daemon(paths: &Paths) -> bool {
    let Some(pid) = dnsmasq::read_pid_file(&paths.daemon_pid_file()) else {
        return false;
    };
    if !dnsmasq::process_alive(pid) {
        return false;
    }
    kill(Pid::from_raw(pid), Signal::SIGUSR1).is_ok()
}

/// Signals the daemon, kickstarting its launchd job first if it is down.
pub async fn kick_daemon(paths: &Paths) -> bool {
    if signal_daemon(paths) {
        return true;
    }
    if launchd::kickstart(&daemon_label()).await.is_err() {
        return false;
    }
    sleep(RETRY_DELAY).await;
    signal_daemon(paths)
}

/// Polls the managed services until they all match the wanted shape.
/// Returns the names still failing at the deadline.
async fn wait_for_dns(paths: &Paths, want_loopback: bool) -> Vec<String> {
    let exclude = services::load_exclude_set(&paths.exclude_services_file());
    let managed = match services::compute_managed_services(&exclude).await {
        Ok(m) if !m.is_empty() => m,
        _ => return Vec::new(),
    };

    let deadline = Instant::now() + CONFIRM_TIMEOUT;
    let mut failing: Vec<String> = Vec::new();

    loop {
        failing.clear();
        for info in &managed {
            let at_loopback = match system_dns::get_dns_servers(&info.name).await {
                Ok(current) => system_dns::is_loopback(&current),
                Err(_) => false,
            };
            if at_loopback != want_loopback {
                failing.push(info.name.clone());
            }
        }

        if failing.is_empty() || Instant::now() >= deadline {
            return failing;
        }
        sleep(RETRY_DELAY).await;
    }
}

async fn kick_and_confirm(paths: &Paths, want_loopback: bool, what: &str) -> Result<()> {
    if !kick_daemon(paths).await {
        warn!("could not signal the daemon; waiting for it to notice on its own");
    }

    let failing = wait_for_dns(paths, want_loopback).await;
    if !failing.is_empty() {
        return Err(MacblockError::PartialFailure {
            failures: failing.into_iter().map(|s| format!("{s}: DNS not {what}")).collect(),
        });
    }
    Ok(())
}

pub async fn do_enable(paths: &Paths) -> Result<()> {
    check_installed(paths)?;
    mutate_state(paths, |st| {
        st.enabled = true;
        st.paused_until = None;
    })?;

    kick_and_confirm(paths, true, "redirected").await?;
    println!("enabled - DNS blocking is active");
    Ok(())
}

pub async fn do_disable(paths: &Paths) -> Result<()> {
    check_installed(paths)?;
    mutate_state(paths, |st| {
        st.enabled = false;
        st.paused_until = None;
    })?;

    kick_and_confirm(paths, false, "restored").await?;
    println!("disabled - DNS restored to original settings");
    Ok(())
}

pub async fn do_pause(paths: &Paths, duration: &str) -> Result<()> {
    check_installed(paths)?;
    let secs = parse_duration_secs(duration)?;
    let resume_at = now_epoch() + secs as i64;

    mutate_state(paths, |st| {
        st.enabled = true;
        st.paused_until = Some(resume_at);
    })?;

    kick_and_confirm(paths, false, "restored").await?;
    println!("paused for {duration} - blocking auto-resumes");
    Ok(())
}

pub async fn do_resume(paths: &Paths) -> Result<()> {
    check_installed(paths)?;
    mutate_state(paths, |st| {
        st.enabled = true;
        st.paused_until = None;
    })?;

    kick_and_confirm(paths, true, "redirected").await?;
    println!("resumed - DNS blocking is active");
    Ok(())
}

pub async fn do_update(paths: &Paths, opts: &blocklist::UpdateOptions) -> Result<()> {
    let _lock = lock_state_dir(paths)?;
    let count = blocklist::update_blocklist(paths, opts).await?;
    println!("blocklist entries: {count}");
    Ok(())
}

pub fn sources_list(paths: &Paths) -> Result<()> {
    let state = load_state(&paths.state_file())?;
    let selected = state
        .source
        .unwrap_or_else(|| blocklist::DEFAULT_SOURCE.to_string());

    for def in blocklist::SOURCES {
        let marker = if def.key == selected { "*" } else { " " };
        println!("{marker} {:<22} {}", def.key, def.title);
    }
    if !blocklist::SOURCES.iter().any(|d| d.key == selected) {
        println!("* {selected} (custom)");
    }
    Ok(())
}

pub fn sources_set(paths: &Paths, selector: &str) -> Result<()> {
    blocklist::sources::resolve(selector)?;
    mutate_state(paths, |st| {
        st.source = Some(selector.to_string());
    })?;
    println!("source set to {selector}; run 'sudo macblock update' to apply");
    Ok(())
}

async fn recompile_and_report(paths: &Paths) -> Result<()> {
    match blocklist::recompile_from_raw(paths).await? {
        Some(count) => println!("blocklist entries: {count}"),
        None => println!("no blocklist compiled yet; run 'sudo macblock update'"),
    }
    Ok(())
}

pub async fn list_add(paths: &Paths, file: &std::path::Path, domain: &str) -> Result<()> {
    let _lock = lock_state_dir(paths)?;
    if lists::add(file, domain)? {
        recompile_and_report(paths).await
    } else {
        println!("already present");
        Ok(())
    }
}

pub async fn list_remove(paths: &Paths, file: &std::path::Path, domain: &str) -> Result<()> {
    let _lock = lock_state_dir(paths)?;
    if lists::remove(file, domain)? {
        recompile_and_report(paths).await
    } else {
        println!("not present");
        Ok(())
    }
}

pub fn list_show(file: &std::path::Path) -> Result<()> {
    for domain in lists::read_list(file)? {
        println!("{domain}");
    }
    Ok(())
}

pub fn upstreams_list(paths: &Paths) -> Result<()> {
    for ip in upstreams::read_fallbacks(&paths.upstream_fallbacks_file()) {
        println!("{ip}");
    }
    Ok(())
}

pub async fn upstreams_set(paths: &Paths, ips: &[String]) -> Result<()> {
    if ips.is_empty() {
        return Err(MacblockError::user("at least one IP is required"));
    }
    let mut valid = Vec::new();
    for raw in ips {
        let ip: std::net::IpAddr = raw
            .parse()
            .map_err(|_| MacblockError::user(format!("not an IP address: {raw:?}")))?;
        if ip.is_loopback() {
            return Err(MacblockError::user("loopback cannot be an upstream"));
        }
        valid.push(ip.to_string());
    }

    let _lock = lock_state_dir(paths)?;
    upstreams::write_fallbacks(&paths.upstream_fallbacks_file(), &valid)?;
    drop(_lock);

    kick_daemon(paths).await;
    println!("fallback upstreams: {}", valid.join(", "));
    Ok(())
}

pub async fn upstreams_reset(paths: &Paths) -> Result<()> {
    let defaults: Vec<String> = upstreams::DEFAULT_FALLBACKS.iter().map(|s| s.to_string()).collect();
    {
        let _lock = lock_state_dir(paths)?;
        upstreams::write_fallbacks(&paths.upstream_fallbacks_file(), &defaults)?;
    }

    kick_daemon(paths).await;
    println!("fallback upstreams reset to {}", defaults.join(", "));
    Ok(())
}
