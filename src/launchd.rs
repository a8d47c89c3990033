//! Thin launchctl wrappers.

use std::path::Path;
use std::time::Duration;

use crate::error::{MacblockError, Result};
use crate::exec;

const LAUNCHCTL: &str = "/bin/launchctl";

fn timeout() -> Duration {
    Duration::from_secs(30)
}

async fn launchctl(args: &[&str]) -> Result<()> {
    let r = exec::run(LAUNCHCTL, args, timeout()).await?;
    if !r.success() {
        let msg = if !r.stderr.trim().is_empty() {
            r.stderr.trim().to_string()
        } else if !r.stdout.trim().is_empty() {
            r.stdout.trim().to_string()
        } else {
            format!("launchctl {} failed (exit {})", args.join(" "), r.exit_code)
        };
        return Err(MacblockError::transient(msg));
    }
    Ok(())
}

pub async fn bootstrap_system(plist: &Path) -> Result<()> {
    launchctl(&["bootstrap", "system", &plist.to_string_lossy()]).await
}

pub async fn bootout_system(plist: &Path) -> Result<()> {
    launchctl(&["bootout", "system", &plist.to_string_lossy()]).await
}

pub async fn enable_service(label: &str) -> Result<()> {
    launchctl(&["enable", &format!("system/{label}")]).await
}

/// Restarts the job, starting it if not running.
pub async fn kickstart(label: &str) -> Result<()> {
    launchctl(&["kickstart", "-k", &format!("system/{label}")]).await
}

pub async fn service_exists(label: &str) -> bool {
    match exec::run(LAUNCHCTL, &["print", &format!("system/{label}")], timeout()).await {
        Ok(r) => r.success(),
        Err(_) => false,
    }
}
