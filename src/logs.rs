//! Log tailing for the launchd-captured component logs.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{MacblockError, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Daemon,
    Dnsmasq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    /// stdout when the file exists, otherwise the best alternative.
    Auto,
}

fn resolve_path(paths: &Paths, component: Component, stream: LogStream) -> PathBuf {
    match (component, stream) {
        (Component::Daemon, LogStream::Stdout) => paths.daemon_out_log(),
        (Component::Daemon, LogStream::Stderr) => paths.daemon_err_log(),
        (Component::Daemon, LogStream::Auto) => {
            let out = paths.daemon_out_log();
            if out.exists() {
                out
            } else {
                paths.daemon_err_log()
            }
        }
        (Component::Dnsmasq, LogStream::Stdout) => paths.dnsmasq_out_log(),
        (Component::Dnsmasq, LogStream::Stderr) => paths.dnsmasq_err_log(),
        (Component::Dnsmasq, LogStream::Auto) => {
            let out = paths.dnsmasq_out_log();
            if out.exists() {
                out
            } else {
                // dnsmasq mostly logs through its facility file.
                paths.dnsmasq_facility_log()
            }
        }
    }
}

fn tail_lines(text: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].to_vec()
}

pub async fn show_logs(
    paths: &Paths,
    component: Component,
    lines: usize,
    follow: bool,
    stream: LogStream,
) -> Result<i32> {
    let path = resolve_path(paths, component, stream);

    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("log file not found: {}", path.display());
            eprintln!("the service may not have started yet; run 'macblock doctor'");
            return Ok(1);
        }
        Err(e) => {
            return Err(MacblockError::TransientIo(format!(
                "reading {}: {e}",
                path.display()
            )))
        }
    };
    let text = String::from_utf8_lossy(&bytes);

    for line in tail_lines(&text, lines) {
        println!("{line}");
    }

    if !follow {
        return Ok(0);
    }

    eprintln!("--- following {} (Ctrl+C to stop) ---", path.display());
    let mut offset = bytes.len() as u64;
    loop {
        sleep(Duration::from_millis(250)).await;

        let Ok(mut file) = std::fs::File::open(&path) else {
            continue;
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < offset {
            // Rotated or truncated; start over from the top.
            offset = 0;
        }
        if len == offset {
            continue;
        }

        if file.seek(SeekFrom::Start(offset)).is_err() {
            continue;
        }
        let mut chunk = Vec::new();
        if file.read_to_end(&mut chunk).is_err() {
            continue;
        }
        offset = len;
        print!("{}", String::from_utf8_lossy(&chunk));
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(text, 10), vec!["a", "b", "c", "d"]);
        assert_eq!(tail_lines("", 3), Vec::<&str>::new());
    }

    #[test]
    fn test_auto_prefers_stdout_then_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(dir.path());

        assert_eq!(
            resolve_path(&paths, Component::Daemon, LogStream::Auto),
            paths.daemon_err_log()
        );

        std::fs::create_dir_all(paths.log_dir()).unwrap();
        std::fs::write(paths.daemon_out_log(), "x\n").unwrap();
        assert_eq!(
            resolve_path(&paths, Component::Daemon, LogStream::Auto),
            paths.daemon_out_log()
        );

        assert_eq!(
            resolve_path(&paths, Component::Dnsmasq, LogStream::Auto),
            paths.dnsmasq_facility_log()
        );
    }
}
