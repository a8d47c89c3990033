//! State-store behavior across control-plane-style edit cycles.

use macblock::error::MacblockError;
use macblock::state::{load_state, now_epoch, save_state, DnsServers, ServiceBackup, State};

#[test]
fn test_state_survives_edit_cycles_with_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    // A future schema wrote extra fields we do not know about.
    std::fs::write(
        &path,
        r#"{
            "schema_version": 3,
            "enabled": false,
            "telemetry_opt_in": true,
            "dns_backup": {"Wi-Fi": {"dns": ["8.8.8.8"], "search": "Empty"}}
        }"#,
    )
    .unwrap();

    // An enable-style edit, as the control plane performs it.
    let mut st = load_state(&path).unwrap();
    st.enabled = true;
    st.paused_until = None;
    save_state(&path, &st).unwrap();

    // A pause-style edit on top.
    let mut st = load_state(&path).unwrap();
    st.paused_until = Some(now_epoch() + 600);
    save_state(&path, &st).unwrap();

    let final_state = load_state(&path).unwrap();
    assert!(final_state.enabled);
    assert!(final_state.paused_until.is_some());
    assert_eq!(final_state.extra["telemetry_opt_in"], true);
    assert_eq!(
        final_state.dns_backup["Wi-Fi"],
        ServiceBackup {
            dns: DnsServers::Servers(vec!["8.8.8.8".to_string()]),
            search: DnsServers::Empty,
        }
    );
}

#[test]
fn test_corrupt_state_is_fatal_with_repair_hint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    for bad in [
        r#"{ "enabled": true, "schema_version": "two" }"#,
        "[]",
        "not json at all",
        r#"{"dns_backup": {"Wi-Fi": 42}}"#,
    ] {
        std::fs::write(&path, bad).unwrap();
        let err = load_state(&path).unwrap_err();
        assert!(matches!(err, MacblockError::StateCorrupt(_)), "input: {bad}");
        let msg = err.to_string();
        assert!(msg.contains("state.json"), "message names the file: {msg}");
        assert!(msg.contains("repair"), "message carries the remedy: {msg}");
        assert_eq!(err.exit_code(), 1);
    }
}

#[test]
fn test_pause_lifecycle_at_state_level() {
    // pause 10s: off at t+5, timer pending; on again once expired and cleared.
    let t0 = 1_000_000;
    let mut st = State { enabled: true, ..State::default() };
    st.paused_until = Some(t0 + 10);

    assert!(!st.effective_on(t0 + 5));
    assert_eq!(st.seconds_until_resume(t0 + 5), Some(5));

    assert!(st.effective_on(t0 + 10));
    assert!(st.clear_expired_pause(t0 + 10));
    assert_eq!(st.paused_until, None);
    assert!(st.effective_on(t0 + 10));
}

#[test]
fn test_interrupted_write_leaves_old_contents() {
    // write_atomic goes through a temp file; a crash before rename leaves
    // only a stale temp behind, never a truncated target.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let old = State::default();
    save_state(&path, &old).unwrap();
    let before = std::fs::read_to_string(&path).unwrap();

    // Simulate the crash artifact and verify cleanup leaves the target alone.
    std::fs::write(dir.path().join(".macblock-crash.tmp"), "partial").unwrap();
    let removed = macblock::fs::remove_stale_temps(dir.path()).unwrap();
    assert_eq!(removed, 1);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn test_empty_sentinel_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut st = State::default();
    st.dns_backup.insert(
        "Ethernet".to_string(),
        ServiceBackup { dns: DnsServers::Empty, search: DnsServers::Empty },
    );
    save_state(&path, &st).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"Empty\""));

    let loaded = load_state(&path).unwrap();
    assert_eq!(loaded.dns_backup["Ethernet"].dns, DnsServers::Empty);
}
