/// Camera configuration: stored form, file store and the legacy env fallback
use common::config_store::{self, ConfigError, ConfigStore};
use common::profile::Mapping;
use common::CameraProfile;
use serde_json::json;
use std::collections::HashMap;

fn mapping(value: serde_json::Value) -> Mapping {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[test]
fn parse_then_store_keeps_every_field() {
    let raw = mapping(json!({
        "ip": "192.168.1.20",
        "rtsp_port": "8554",
        "onvif_port": 8080,
        "user": "admin",
        "password": "p@ss",
        "rtsp_url": "",
        "label": "ignored",
    }));

    let profile = CameraProfile::parse(&raw).unwrap();
    let stored = profile.to_mapping();

    assert_eq!(stored["ip"], "192.168.1.20");
    assert_eq!(stored["rtsp_port"], 8554);
    assert_eq!(stored["onvif_port"], 8080);
    assert_eq!(stored["rtsp_url"], "");
    assert!(!stored.contains_key("label"));
    assert_eq!(CameraProfile::parse(&stored).unwrap(), profile);
    assert_eq!(
        profile.connection_url(),
        "rtsp://admin:p@ss@192.168.1.20:8554/live/ch0"
    );
}

#[test]
fn unknown_keys_do_not_change_identity() {
    let a = CameraProfile::parse(&mapping(json!({"ip": "10.0.0.1"}))).unwrap();
    let b = CameraProfile::parse(&mapping(json!({"ip": "10.0.0.1", "zoom": true}))).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn store_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("nested").join("cameras.json"));
    assert!(store.load().await.unwrap().is_empty());

    let profiles = vec![
        CameraProfile::new("10.0.0.1").with_credentials("admin", "one"),
        CameraProfile::new("10.0.0.2").with_rtsp_url("rtsp://10.0.0.2/stream2"),
    ];
    store.save(&profiles).await.unwrap();

    assert_eq!(store.load().await.unwrap(), profiles);
}

#[tokio::test]
async fn malformed_port_aborts_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cameras.json");
    std::fs::write(
        &path,
        r#"[{"ip": "10.0.0.1"}, {"ip": "10.0.0.2", "rtsp_port": "five-five-four"}]"#,
    )
    .unwrap();

    match ConfigStore::new(&path).load().await {
        Err(ConfigError::Invalid { index, source }) => {
            assert_eq!(index, 1);
            assert_eq!(source.field, "rtsp_port");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn batch_validation_rejects_duplicates() {
    let entries = vec![
        mapping(json!({"ip": "10.0.0.1"})),
        mapping(json!({"ip": "10.0.0.1", "user": "other"})),
    ];
    assert!(matches!(
        config_store::parse_all(&entries),
        Err(ConfigError::Invalid { index: 1, .. })
    ));
}

#[test]
fn legacy_env_variables_stop_at_first_gap() {
    let vars: HashMap<&str, &str> = [
        ("CAMERA1_IP", "10.0.0.1"),
        ("CAMERA1_PORT", "8554"),
        ("CAMERA1_USER", "admin"),
        ("CAMERA1_PASS", "pw"),
        ("CAMERA2_IP", "10.0.0.2"),
        ("CAMERA4_IP", "10.0.0.4"),
    ]
    .into_iter()
    .collect();

    let profiles =
        config_store::profiles_from_vars(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[0].rtsp_port, 8554);
    assert_eq!(profiles[0].connection_url(), "rtsp://admin:pw@10.0.0.1:8554/live/ch0");
    assert_eq!(profiles[1].user, "");
}
