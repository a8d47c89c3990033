//! Built-in blocklist source catalog.

use crate::error::{MacblockError, Result};

#[derive(Debug, Clone, Copy)]
pub struct SourceDef {
    pub key: &'static str,
    pub title: &'static str,
    pub url: &'static str,
    /// Pinned digest of the published list, where the publisher provides one.
    pub sha256: Option<&'static str>,
}

pub const DEFAULT_SOURCE: &str = "stevenblack";

pub const SOURCES: &[SourceDef] = &[
    SourceDef {
        key: "stevenblack",
        title: "StevenBlack Unified",
        url: "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts",
        sha256: None,
    },
    SourceDef {
        key: "stevenblack-fakenews",
        title: "StevenBlack + Fakenews",
        url: "https://raw.githubusercontent.com/StevenBlack/hosts/master/alternates/fakenews/hosts",
        sha256: None,
    },
    SourceDef {
        key: "stevenblack-gambling",
        title: "StevenBlack + Gambling",
        url: "https://raw.githubusercontent.com/StevenBlack/hosts/master/alternates/gambling/hosts",
        sha256: None,
    },
    SourceDef {
        key: "hagezi-pro",
        title: "HaGeZi Pro",
        url: "https://cdn.jsdelivr.net/gh/hagezi/dns-blocklists@latest/hosts/pro.txt",
        sha256: None,
    },
    SourceDef {
        key: "hagezi-ultimate",
        title: "HaGeZi Ultimate",
        url: "https://cdn.jsdelivr.net/gh/hagezi/dns-blocklists@latest/hosts/ultimate.txt",
        sha256: None,
    },
    SourceDef {
        key: "oisd-small",
        title: "OISD Small",
        url: "https://small.oisd.nl/hosts",
        sha256: None,
    },
    SourceDef {
        key: "oisd-big",
        title: "OISD Big",
        url: "https://big.oisd.nl/hosts",
        sha256: None,
    },
];

pub fn find(key: &str) -> Option<&'static SourceDef> {
    SOURCES.iter().find(|s| s.key == key)
}

/// A resolved source selector: a catalog entry or a custom HTTPS URL.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    Named(&'static SourceDef),
    Custom(String),
}

impl ResolvedSource {
    pub fn url(&self) -> &str {
        match self {
            Self::Named(def) => def.url,
            Self::Custom(url) => url,
        }
    }

    pub fn pinned_sha256(&self) -> Option<&str> {
        match self {
            Self::Named(def) => def.sha256,
            Self::Custom(_) => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

/// Resolves a selector: catalog key, or an `https://` URL for custom lists.
pub fn resolve(selector: &str) -> Result<ResolvedSource> {
    if let Some(def) = find(selector) {
        return Ok(ResolvedSource::Named(def));
    }

    if selector.starts_with("https://") {
        let parsed = url::Url::parse(selector)
            .map_err(|e| MacblockError::user(format!("invalid source URL {selector:?}: {e}")))?;
        if parsed.host_str().is_none() {
            return Err(MacblockError::user(format!("source URL has no host: {selector:?}")));
        }
        return Ok(ResolvedSource::Custom(selector.to_string()));
    }

    if selector.starts_with("http://") {
        return Err(MacblockError::user("custom sources must use https"));
    }

    Err(MacblockError::user(format!(
        "unknown source {selector:?}; see 'macblock sources list'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_source_is_in_catalog() {
        assert!(find(DEFAULT_SOURCE).is_some());
    }

    #[test]
    fn test_resolve_named() {
        let s = resolve("hagezi-pro").unwrap();
        assert!(!s.is_custom());
        assert!(s.url().contains("hagezi"));
    }

    #[test]
    fn test_resolve_custom_https() {
        let s = resolve("https://lists.example/hosts.txt").unwrap();
        assert!(s.is_custom());
        assert_eq!(s.url(), "https://lists.example/hosts.txt");
    }

    #[test]
    fn test_resolve_rejects_plain_http_and_unknown() {
        assert!(resolve("http://lists.example/hosts.txt").is_err());
        assert!(resolve("no-such-source").is_err());
    }
}
