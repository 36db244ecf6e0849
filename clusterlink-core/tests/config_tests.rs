//! Agent config load/save integration tests against a temporary home.

use std::fs;

use assert_fs::prelude::*;
use clusterlink_core::{config, AgentConfig, ConfigError, ResourceKind};
use predicates::prelude::predicate;
use rstest::rstest;

fn write_config(home: &assert_fs::TempDir, yaml: &str) {
    let dir = home.path().join(".clusterlink");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("agent.yaml"), yaml).expect("write");
}

#[test]
fn missing_config_yields_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, AgentConfig::default());
}

#[test]
fn save_then_load_preserves_fields() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = AgentConfig {
        sync_timeout_secs: 5,
        parallel_sync: false,
        observer_queue: 16,
        kinds: vec![ResourceKind::Pod, ResourceKind::Namespace],
        manifest_dir: Some("cluster-a".into()),
    };
    config::save_at(home.path(), &cfg).expect("save");

    home.child(".clusterlink/agent.yaml")
        .assert(predicate::path::exists());
    home.child(".clusterlink/agent.yaml.tmp")
        .assert(predicate::path::missing());

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded, cfg);
}

#[test]
fn partial_yaml_fills_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, "sync_timeout_secs: 12\nkinds: [pod, configMap]\n");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.sync_timeout_secs, 12);
    assert_eq!(loaded.kinds, vec![ResourceKind::Pod, ResourceKind::ConfigMap]);
    assert!(loaded.parallel_sync);
    assert_eq!(loaded.observer_queue, config::DEFAULT_OBSERVER_QUEUE);
}

#[test]
fn empty_file_yields_defaults() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, "");
    assert_eq!(
        config::load_at(home.path()).expect("load"),
        AgentConfig::default()
    );
}

#[test]
fn corrupt_yaml_reports_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".clusterlink");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("agent.yaml"), b"kinds: [pod, widget]\n").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("agent.yaml"));
}

#[rstest]
#[case("sync_timeout_secs: 0\n", "sync_timeout_secs")]
#[case("observer_queue: 0\n", "observer_queue")]
#[case("kinds: []\n", "kinds")]
fn invalid_values_are_rejected(#[case] yaml: &str, #[case] field: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, yaml);

    let err = config::load_at(home.path()).unwrap_err();
    match err {
        ConfigError::Invalid { field: got, .. } => assert_eq!(got, field),
        other => panic!("expected Invalid, got: {other}"),
    }
}

#[cfg(unix)]
#[test]
fn saved_config_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &AgentConfig::default()).expect("save");
    let mode = fs::metadata(config::config_path_at(home.path()))
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}
