//! Allow/deny list files (`whitelist.txt`, `blacklist.txt`).
//!
//! One normalized domain per line, `#` comments. Readers are tolerant: an
//! invalid line earns a stderr warning naming the file and line number and is
//! skipped, never an error, so a stray edit can't wedge `list`/`add`/`remove`
//! or the compiler. Writers rewrite the file sorted and atomic.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{MacblockError, Result};
use crate::fs::write_atomic;

/// Normalizes a domain: lowercase, trailing dot stripped, ASCII hostname
/// labels only.
pub fn normalize_domain(raw: &str) -> Result<String> {
    let d = raw.trim().trim_matches('.').to_ascii_lowercase();
    if d.is_empty() || d.len() > 253 {
        return Err(MacblockError::user(format!("invalid domain: {raw:?}")));
    }
    for label in d.split('.') {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !ok {
            return Err(MacblockError::user(format!("invalid domain: {raw:?}")));
        }
    }
    Ok(d)
}

/// Parses list-file text. Returns the valid domains and the `(line_no, text)`
/// of every rejected line.
pub fn parse_list(text: &str) -> (BTreeSet<String>, Vec<(usize, String)>) {
    let mut domains = BTreeSet::new();
    let mut rejected = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match normalize_domain(line) {
            Ok(d) => {
                domains.insert(d);
            }
            Err(_) => rejected.push((idx + 1, line.to_string())),
        }
    }

    (domains, rejected)
}

/// Reads a list file, warning on stderr for each invalid line.
///
/// A missing file is an empty list.
pub fn read_list(path: &Path) -> Result<BTreeSet<String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e.into()),
    };

    let (domains, rejected) = parse_list(&text);
    for (line_no, line) in rejected {
        eprintln!(
            "warning: {}:{line_no}: skipping invalid domain {line:?}",
            path.display()
        );
    }
    Ok(domains)
}

/// Writes the set back, sorted, atomically, mode 0644.
pub fn write_list(path: &Path, domains: &BTreeSet<String>) -> Result<()> {
    let mut text = String::new();
    for d in domains {
        text.push_str(d);
        text.push('\n');
    }
    write_atomic(path, text.as_bytes(), 0o644)?;
    Ok(())
}

/// Adds a domain. Returns false when it was already present.
pub fn add(path: &Path, raw: &str) -> Result<bool> {
    let domain = normalize_domain(raw)?;
    let mut domains = read_list(path)?;
    let inserted = domains.insert(domain);
    if inserted {
        write_list(path, &domains)?;
    }
    Ok(inserted)
}

/// Removes a domain. Returns false when it was not present.
pub fn remove(path: &Path, raw: &str) -> Result<bool> {
    let domain = normalize_domain(raw)?;
    let mut domains = read_list(path)?;
    let removed = domains.remove(&domain);
    if removed {
        write_list(path, &domains)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_accepts_ordinary_domains() {
        assert_eq!(normalize_domain("Example.COM.").unwrap(), "example.com");
        assert_eq!(normalize_domain("  a.b-c.de ").unwrap(), "a.b-c.de");
        assert_eq!(normalize_domain("xn--bcher-kva.example").unwrap(), "xn--bcher-kva.example");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("-bad.example").is_err());
        assert!(normalize_domain("bad-.example").is_err());
        assert!(normalize_domain("sp ace.example").is_err());
        assert!(normalize_domain("über.example").is_err());
        assert!(normalize_domain(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_parse_list_mixed_lines() {
        let text = "# comment\nexample.com\nnot a domain!\n\nADS.example\n";
        let (domains, rejected) = parse_list(text);
        assert!(domains.contains("example.com"));
        assert!(domains.contains("ads.example"));
        assert_eq!(domains.len(), 2);
        assert_eq!(rejected, vec![(3, "not a domain!".to_string())]);
    }

    #[test]
    fn test_add_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist.txt");

        assert!(add(&path, "B.example").unwrap());
        assert!(add(&path, "a.example").unwrap());
        assert!(!add(&path, "b.EXAMPLE").unwrap());

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a.example\nb.example\n");

        assert!(remove(&path, "a.example").unwrap());
        assert!(!remove(&path, "a.example").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "b.example\n");
    }

    #[test]
    fn test_invalid_lines_survive_read_but_not_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.txt");
        std::fs::write(&path, "good.example\n!!bad!!\n").unwrap();

        let domains = read_list(&path).unwrap();
        assert_eq!(domains.len(), 1);

        // add() rewrites the file; only valid lines remain.
        add(&path, "new.example").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "good.example\nnew.example\n");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_list(&dir.path().join("none.txt")).unwrap().is_empty());
    }
}
