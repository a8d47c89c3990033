//! End-to-end checks of the resolver-table → upstream rendering and the
//! blocklist compile/recompile pipeline, on a temp-dir layout.

use std::collections::BTreeSet;

use macblock::blocklist::{self, compile, SAFETY_FLOOR};
use macblock::lists;
use macblock::paths::Paths;
use macblock::resolvers::parse_scutil_dns;
use macblock::upstreams;

#[test]
fn test_resolver_fragment_renders_expected_upstreams() {
    // Default resolver carries a loopback entry that must not survive;
    // the scoped resolver becomes a per-domain server line.
    let fragment = "\
resolver #1
  nameserver[0] : 1.1.1.1
  nameserver[1] : 127.0.0.1
resolver #2
  domain : corp.example.
  nameserver[0] : 10.0.0.53
";
    let table = parse_scutil_dns(fragment);
    assert_eq!(table.default, vec!["1.1.1.1"]);
    assert_eq!(table.per_domain["corp.example"], vec!["10.0.0.53"]);

    let rendered = upstreams::render(&table.default, &table, &[]);
    assert_eq!(rendered, "server=1.1.1.1\nserver=/corp.example/10.0.0.53\n");
}

#[test]
fn test_small_source_stays_below_the_floor() {
    // 42 domains from a source must never reach the output files.
    let mut text = String::new();
    for i in 0..42 {
        text.push_str(&format!("0.0.0.0 host{i}.example\n"));
    }
    let parsed = compile::parse_hosts_domains(&text);
    assert_eq!(parsed.len(), 42);
    assert!(parsed.len() < SAFETY_FLOOR);
}

#[test]
fn test_compile_applies_allow_and_deny() {
    let text = "\
0.0.0.0 ads.example
0.0.0.0 tracker.example
0.0.0.0 cdn.example
";
    let parsed = compile::parse_hosts_domains(text);
    let allow: BTreeSet<String> = ["cdn.example".to_string()].into();
    let deny: BTreeSet<String> = ["extra.example".to_string()].into();

    let final_set = compile::apply_lists(&parsed, &allow, &deny);
    let conf = compile::render_conf(&final_set);

    assert!(conf.contains("address=/ads.example/"));
    assert!(conf.contains("address=/tracker.example/"));
    assert!(conf.contains("address=/extra.example/"));
    assert!(!conf.contains("cdn.example"));
}

#[tokio::test]
async fn test_recompile_from_raw_rebuilds_conf_only() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::rooted(dir.path());
    std::fs::create_dir_all(paths.run_dir()).unwrap();
    std::fs::create_dir_all(paths.conf_dir()).unwrap();

    std::fs::write(paths.blocklist_raw(), "ads.example\nok.example\n").unwrap();
    std::fs::write(paths.whitelist_file(), "ok.example\n").unwrap();
    std::fs::write(paths.blacklist_file(), "manual.example\n").unwrap();

    let count = blocklist::recompile_from_raw(&paths).await.unwrap();
    assert_eq!(count, Some(2));

    let conf = std::fs::read_to_string(paths.blocklist_conf()).unwrap();
    assert_eq!(conf, "address=/ads.example/\naddress=/manual.example/\n");

    // The raw list is the recompile input and must be untouched.
    assert_eq!(
        std::fs::read_to_string(paths.blocklist_raw()).unwrap(),
        "ads.example\nok.example\n"
    );
}

#[tokio::test]
async fn test_recompile_without_raw_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::rooted(dir.path());

    assert_eq!(blocklist::recompile_from_raw(&paths).await.unwrap(), None);
    assert!(!paths.blocklist_conf().exists());
}

#[test]
fn test_list_files_tolerate_invalid_lines_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("whitelist.txt");
    std::fs::write(
        &file,
        "# comment\ngood.example\nthis is !! not valid\nanother.example\n",
    )
    .unwrap();

    // list, add and remove all keep working and keep the valid lines.
    let listed = lists::read_list(&file).unwrap();
    assert_eq!(listed.len(), 2);

    assert!(lists::add(&file, "third.example").unwrap());
    assert!(lists::remove(&file, "good.example").unwrap());

    let text = std::fs::read_to_string(&file).unwrap();
    assert_eq!(text, "another.example\nthird.example\n");
}
