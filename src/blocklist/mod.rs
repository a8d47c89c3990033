//! Blocklist update pipeline: download, verify, compile, apply.
//!
//! The pipeline is all-or-nothing. Nothing on disk changes until the
//! downloaded list has passed the HTML sniff, the optional digest pin and the
//! safety floor; `last_update_at` is only persisted after dnsmasq has
//! acknowledged the reload, so state and the compiled set can never drift
//! apart.

pub mod compile;
pub mod sources;

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::dnsmasq;
use crate::error::{MacblockError, Result};
use crate::fs::write_atomic;
use crate::lists;
use crate::paths::Paths;
use crate::state::{load_state, now_epoch, save_state};

pub use sources::{ResolvedSource, SourceDef, DEFAULT_SOURCE, SOURCES};

/// Hard cap on a downloaded list.
pub const MAX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Minimum domain count for a compile result to be applied.
pub const SAFETY_FLOOR: usize = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("macblock/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Selector override; falls back to the state's source, then the default.
    pub source: Option<String>,
    /// Explicit digest pin, overriding the catalog's.
    pub sha256: Option<String>,
    /// Safety-floor override; honored for custom HTTPS sources only.
    pub floor: Option<usize>,
}

/// Angle-bracket sniff on the first kilobyte: a hosts file has essentially
/// no markup, an error page or login portal opens with a tag and is dense
/// with them.
pub fn looks_like_html(head: &[u8]) -> bool {
    let head = &head[..head.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    if text.trim_start().starts_with('<') {
        return true;
    }
    let brackets = head.iter().filter(|&&b| b == b'<' || b == b'>').count();
    brackets >= 16
}

async fn download(url: &str, expected_sha256: Option<&str>) -> Result<String> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(TOTAL_TIMEOUT)
        .build()
        .map_err(|e| MacblockError::transient(format!("building http client: {e}")))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| MacblockError::transient(format!("downloading {url}: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(MacblockError::transient(format!("downloading {url}: HTTP {status}")));
    }

    let mut hasher = Sha256::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut sniffed = false;

    let mut resp = resp;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| MacblockError::transient(format!("reading {url}: {e}")))?
    {
        buf.extend_from_slice(&chunk);
        hasher.update(&chunk);

        if buf.len() as u64 > MAX_DOWNLOAD_BYTES {
            return Err(MacblockError::user(format!(
                "blocklist too large (> {MAX_DOWNLOAD_BYTES} bytes)"
            )));
        }
        if !sniffed && buf.len() >= 1024 {
            sniffed = true;
            if looks_like_html(&buf) {
                return Err(MacblockError::user(
                    "source returned HTML, not a hosts file (captive portal or error page?)",
                ));
            }
        }
    }

    if !sniffed && looks_like_html(&buf) {
        return Err(MacblockError::user(
            "source returned HTML, not a hosts file (captive portal or error page?)",
        ));
    }

    if let Some(expected) = expected_sha256 {
        let expected = expected.trim().to_ascii_lowercase();
        let actual = hex::encode(hasher.finalize());
        if expected != actual {
            return Err(MacblockError::user(format!(
                "sha256 mismatch: expected {expected}, got {actual}"
            )));
        }
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Writes the two output files in their contract order: the raw domain list
/// first, then the dnsmasq rules file.
///
/// `blocklist.raw` holds the normalized source domains before allow/deny are
/// applied; it is what `allow`/`deny` recompile from without re-downloading.
pub fn write_outputs(
    raw_path: &Path,
    conf_path: &Path,
    source_set: &BTreeSet<String>,
    final_set: &BTreeSet<String>,
) -> Result<()> {
    write_atomic(raw_path, compile::render_raw(source_set).as_bytes(), 0o644)?;
    write_atomic(conf_path, compile::render_conf(final_set).as_bytes(), 0o644)?;
    Ok(())
}

/// Recompiles `blocklist.conf` from the existing raw list after an
/// allow/deny edit. Returns `None` when no raw list exists yet.
pub async fn recompile_from_raw(paths: &Paths) -> Result<Option<usize>> {
    let text = match std::fs::read_to_string(paths.blocklist_raw()) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut source: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();
    for line in text.lines() {
        let line = line.trim();
        if !line.is_empty() {
            source.insert(line.to_string());
        }
    }

    let allow = lists::read_list(&paths.whitelist_file())?;
    let deny = lists::read_list(&paths.blacklist_file())?;
    let final_set = compile::apply_lists(&source, &allow, &deny);

    write_atomic(
        &paths.blocklist_conf(),
        compile::render_conf(&final_set).as_bytes(),
        0o644,
    )?;

    if let Err(e) = dnsmasq::reload(paths).await {
        warn!("dnsmasq reload after recompile: {e}");
    }

    Ok(Some(final_set.len()))
}

/// Runs the full update pipeline. Returns the applied domain count.
pub async fn update_blocklist(paths: &Paths, opts: &UpdateOptions) -> Result<usize> {
    let mut state = load_state(&paths.state_file())?;

    let selector = opts
        .source
        .clone()
        .or_else(|| state.source.clone())
        .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
    let source = sources::resolve(&selector)?;

    let floor = match (&source, opts.floor) {
        (ResolvedSource::Custom(_), Some(f)) if f >= 1 => f,
        (ResolvedSource::Custom(_), Some(_)) => {
            return Err(MacblockError::user("safety floor must be at least 1"));
        }
        (ResolvedSource::Named(_), Some(_)) => {
            return Err(MacblockError::user(
                "the safety floor can only be overridden for custom https sources",
            ));
        }
        (_, None) => SAFETY_FLOOR,
    };

    info!("downloading blocklist from {}", source.url());
    let pin = opts.sha256.as_deref().or_else(|| source.pinned_sha256());
    let text = download(source.url(), pin).await?;

    let parsed = compile::parse_hosts_domains(&text);
    if parsed.len() < floor {
        return Err(MacblockError::user(format!(
            "source produced {} domains, below safety floor {floor}; keeping the existing blocklist",
            parsed.len()
        )));
    }

    let allow = lists::read_list(&paths.whitelist_file())?;
    let deny = lists::read_list(&paths.blacklist_file())?;
    let final_set = compile::apply_lists(&parsed, &allow, &deny);
    let source_set: BTreeSet<String> = parsed.into_iter().collect();

    write_outputs(&paths.blocklist_raw(), &paths.blocklist_conf(), &source_set, &final_set)?;
    info!("compiled {} domains", final_set.len());

    dnsmasq::reload(paths).await?;

    state.source = Some(selector);
    state.last_update_at = Some(now_epoch());
    save_state(&paths.state_file(), &state)?;

    if let Err(e) = dnsmasq::verify_canary(&paths.blocklist_raw()).await {
        warn!("post-reload canary check failed: {e}");
    }

    Ok(final_set.len())
}
