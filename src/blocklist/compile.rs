//! Hosts-format parsing and blocklist compilation.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use crate::lists::normalize_domain;

/// Hostnames that appear in every hosts file and must never be blocked.
const SELF_HOSTS: &[&str] = &["localhost", "localhost.localdomain", "broadcasthost", "local"];

fn is_ip_literal(token: &str) -> bool {
    token.parse::<std::net::IpAddr>().is_ok()
}

/// Extracts blockable domains from hosts-format text.
///
/// Accepts `IP host [host ...]` lines (hostnames only) and bare `host`
/// lines. Inline `#` comments are stripped; invalid tokens are dropped
/// silently, since upstream lists routinely carry a few.
pub fn parse_hosts_domains(text: &str) -> FxHashSet<String> {
    let mut domains = FxHashSet::default();

    for raw in text.lines() {
        let mut line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((head, _)) = line.split_once('#') {
            line = head.trim();
        }

        let mut tokens = line.split_whitespace().peekable();
        let Some(first) = tokens.peek() else {
            continue;
        };
        if is_ip_literal(first) {
            tokens.next();
        }

        for token in tokens {
            let Ok(d) = normalize_domain(token) else {
                continue;
            };
            if SELF_HOSTS.contains(&d.as_str()) {
                continue;
            }
            domains.insert(d);
        }
    }

    domains
}

/// Applies the allowlist and denylist: `(source − allow) ∪ deny`.
pub fn apply_lists(
    source: &FxHashSet<String>,
    allow: &BTreeSet<String>,
    deny: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut out: BTreeSet<String> = source
        .iter()
        .filter(|d| !allow.contains(*d))
        .cloned()
        .collect();
    out.extend(deny.iter().cloned());
    out
}

/// One domain per line, sorted.
pub fn render_raw(domains: &BTreeSet<String>) -> String {
    let mut text = String::new();
    for d in domains {
        text.push_str(d);
        text.push('\n');
    }
    text
}

/// dnsmasq NXDOMAIN rules: `address=/<domain>/` per domain.
pub fn render_conf(domains: &BTreeSet<String>) -> String {
    let mut text = String::new();
    for d in domains {
        text.push_str("address=/");
        text.push_str(d);
        text.push_str("/\n");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts_and_bare_formats() {
        let text = "\
# StevenBlack-style header
127.0.0.1  localhost
0.0.0.0    ads.example tracker.example
justadomain.example
0.0.0.0 inline.example # seen 2024-01
";
        let domains = parse_hosts_domains(text);
        assert!(domains.contains("ads.example"));
        assert!(domains.contains("tracker.example"));
        assert!(domains.contains("justadomain.example"));
        assert!(domains.contains("inline.example"));
        assert!(!domains.contains("localhost"));
        assert_eq!(domains.len(), 4);
    }

    #[test]
    fn test_parse_normalizes_case_and_dots() {
        let domains = parse_hosts_domains("0.0.0.0 ADS.Example.\n");
        assert!(domains.contains("ads.example"));
    }

    #[test]
    fn test_parse_drops_invalid_tokens() {
        let domains = parse_hosts_domains("0.0.0.0 good.example bad_token!\n");
        assert_eq!(domains.len(), 1);
        assert!(domains.contains("good.example"));
    }

    #[test]
    fn test_apply_lists_subtracts_and_unions() {
        let mut source = FxHashSet::default();
        source.insert("ads.example".to_string());
        source.insert("ok.example".to_string());

        let allow: BTreeSet<String> = ["ok.example".to_string()].into();
        let deny: BTreeSet<String> = ["extra.example".to_string()].into();

        let out = apply_lists(&source, &allow, &deny);
        assert!(out.contains("ads.example"));
        assert!(out.contains("extra.example"));
        assert!(!out.contains("ok.example"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let mut source = FxHashSet::default();
        source.insert("both.example".to_string());
        let allow: BTreeSet<String> = ["both.example".to_string()].into();
        let deny: BTreeSet<String> = ["both.example".to_string()].into();

        // The allowlist only shields domains the source brought in; an
        // explicit deny entry is always emitted.
        let out = apply_lists(&source, &allow, &deny);
        assert!(out.contains("both.example"));
    }

    #[test]
    fn test_render_outputs_sorted() {
        let domains: BTreeSet<String> =
            ["b.example".to_string(), "a.example".to_string()].into();
        assert_eq!(render_raw(&domains), "a.example\nb.example\n");
        assert_eq!(render_conf(&domains), "address=/a.example/\naddress=/b.example/\n");
    }

    #[test]
    fn test_render_empty_is_empty() {
        let domains = BTreeSet::new();
        assert_eq!(render_raw(&domains), "");
        assert_eq!(render_conf(&domains), "");
    }
}
