//! Desired-state record persisted atomically to `state.json`.
//!
//! The control plane is the only writer; the daemon loads the record at the
//! top of every reconcile. The loader is deliberately two-tier: a missing
//! file is a fresh install (defaults), while an unreadable or malformed file
//! is fatal with a repair hint so a corrupt record can never drive DNS
//! changes. Fields added by newer schemas ride along untouched in `extra`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MacblockError, Result};
use crate::fs::{ensure_dir, write_atomic};
use crate::paths::Paths;

pub const SCHEMA_VERSION: i64 = 3;

/// A per-service DNS server list as networksetup reports it.
///
/// `Empty` is networksetup's literal sentinel for "no static servers, use
/// DHCP" and is distinct from an empty list; restoring `Empty` hands the
/// service back to DHCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DnsServersRepr", into = "DnsServersRepr")]
pub enum DnsServers {
    Empty,
    Servers(Vec<String>),
}

impl Default for DnsServers {
    fn default() -> Self {
        Self::Empty
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DnsServersRepr {
    Servers(Vec<String>),
    Sentinel(String),
}

impl From<DnsServers> for DnsServersRepr {
    fn from(v: DnsServers) -> Self {
        match v {
            DnsServers::Empty => Self::Sentinel("Empty".to_string()),
            DnsServers::Servers(list) => Self::Servers(list),
        }
    }
}

impl TryFrom<DnsServersRepr> for DnsServers {
    type Error = String;

    fn try_from(v: DnsServersRepr) -> std::result::Result<Self, String> {
        match v {
            DnsServersRepr::Servers(list) => Ok(Self::Servers(list)),
            DnsServersRepr::Sentinel(s) if s == "Empty" => Ok(Self::Empty),
            DnsServersRepr::Sentinel(s) => {
                Err(format!("expected \"Empty\" or a server list, got {s:?}"))
            }
        }
    }
}

/// Pre-intercept configuration of one network service; the source of truth
/// for restore.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceBackup {
    pub dns: DnsServers,
    #[serde(default)]
    pub search: DnsServers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub dns_backup: BTreeMap<String, ServiceBackup>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub last_update_at: Option<i64>,
    #[serde(default)]
    pub managed_services: BTreeSet<String>,
    #[serde(default)]
    pub paused_until: Option<i64>,
    #[serde(default = "default_schema_version")]
    pub schema_version: i64,
    #[serde(default)]
    pub source: Option<String>,
    /// Fields from other schema versions, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_schema_version() -> i64 {
    SCHEMA_VERSION
}

impl Default for State {
    fn default() -> Self {
        Self {
            dns_backup: BTreeMap::new(),
            enabled: false,
            last_update_at: None,
            managed_services: BTreeSet::new(),
            paused_until: None,
            schema_version: SCHEMA_VERSION,
            source: None,
            extra: BTreeMap::new(),
        }
    }
}

impl State {
    /// Whether blocking should be in effect right now.
    pub fn effective_on(&self, now: i64) -> bool {
        self.enabled && self.paused_until.is_none_or(|t| now >= t)
    }

    /// Clears an expired pause. Returns true when the record changed.
    pub fn clear_expired_pause(&mut self, now: i64) -> bool {
        match self.paused_until {
            Some(t) if t <= now => {
                self.paused_until = None;
                true
            }
            _ => false,
        }
    }

    /// Seconds until a pending pause expires, if one is scheduled.
    pub fn seconds_until_resume(&self, now: i64) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        match self.paused_until {
            Some(t) if t > now => Some((t - now) as u64),
            Some(_) => Some(0),
            None => None,
        }
    }
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn corrupt(path: &Path, detail: impl std::fmt::Display) -> MacblockError {
    MacblockError::StateCorrupt(format!(
        "state file {} is corrupt: {detail}; repair it or delete it and rerun",
        path.display()
    ))
}

/// Loads the state record. Missing file means first run.
pub fn load_state(path: &Path) -> Result<State> {
    if !path.exists() {
        return Ok(State::default());
    }

    let text = std::fs::read_to_string(path).map_err(|e| corrupt(path, format_args!("unreadable ({e})")))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| corrupt(path, format_args!("invalid JSON ({e})")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| corrupt(path, "top level is not an object"))?;
    if let Some(sv) = obj.get("schema_version") {
        if !sv.is_i64() && !sv.is_u64() {
            return Err(corrupt(path, "schema_version is not an integer"));
        }
    }

    let state: State =
        serde_json::from_value(value).map_err(|e| corrupt(path, format_args!("bad field ({e})")))?;

    if state.schema_version > SCHEMA_VERSION {
        warn!(
            "state schema version {} is newer than supported {}; reading recognized fields only",
            state.schema_version, SCHEMA_VERSION
        );
    }

    Ok(state)
}

/// Takes the advisory lock serializing state-file writers. Held only around
/// file operations, never across subprocess calls.
pub fn lock_state_dir(paths: &Paths) -> Result<Flock<std::fs::File>> {
    ensure_dir(paths.conf_dir(), 0o755)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(paths.lock_file())?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, e)| MacblockError::transient(format!("locking state directory: {e}")))
}

/// Serializes deterministically and writes atomically with mode 0644.
pub fn save_state(path: &Path, state: &State) -> Result<()> {
    let mut text = serde_json::to_string_pretty(state)
        .map_err(|e| MacblockError::transient(format!("serializing state: {e}")))?;
    text.push('\n');
    write_atomic(path, text.as_bytes(), 0o644)?;
    Ok(())
}
