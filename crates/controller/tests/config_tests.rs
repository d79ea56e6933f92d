//! Loading the mounted controller configuration

use kindling_controller::ControllerConfig;
use serial_test::serial;
use std::io::Write;

#[test]
fn mounted_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "watchNamespace: dev\nreconcile:\n  concurrency: 2\n  backoffBaseSeconds: 1\n\
         runner:\n  deregistrationTimeoutSeconds: 60\n"
    )
    .unwrap();

    let config = ControllerConfig::from_mounted_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.watch_namespace.as_deref(), Some("dev"));
    assert_eq!(config.reconcile.concurrency, 2);
    assert_eq!(config.reconcile.backoff_base_seconds, 1);
    assert_eq!(config.runner.deregistration_timeout().as_secs(), 60);
    assert_eq!(config.field_manager, "kindling-controller");
    assert!(config.validate().is_ok());
}

#[test]
fn unreadable_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.yaml");
    assert!(ControllerConfig::from_mounted_file(missing.to_str().unwrap()).is_err());
}

#[test]
#[serial]
fn config_path_honours_environment() {
    std::env::set_var("KINDLING_CONFIG_PATH", "/tmp/kindling.yaml");
    assert_eq!(ControllerConfig::config_path(), "/tmp/kindling.yaml");
    std::env::remove_var("KINDLING_CONFIG_PATH");
    assert_eq!(ControllerConfig::config_path(), "/config/config.yaml");
}
