//! Unit tests for the reattach snapshot model.

use chrono::{TimeZone, Utc};

use world_warden::models::reattach::ReattachInformation;

fn sample() -> ReattachInformation {
    ReattachInformation {
        pid: 4242,
        port: 4777,
        event_port: 39001,
        access_token: "aaaa-bbbb".into(),
        dmb_dir: "/var/lib/warden/deployments/j1".into(),
        launched_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).single().expect("ts"),
    }
}

#[test]
fn serde_round_trips() {
    let info = sample();
    let json = serde_json::to_string(&info).expect("serialize");
    let back: ReattachInformation = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(back, info);
}

#[test]
fn persisted_layout_uses_snake_case_fields() {
    let json = serde_json::to_value(sample()).expect("serialize");

    for key in [
        "pid",
        "port",
        "event_port",
        "access_token",
        "dmb_dir",
        "launched_at",
    ] {
        assert!(json.get(key).is_some(), "missing field {key}");
    }
}
