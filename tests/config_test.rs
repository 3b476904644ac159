//! Loading configuration files from disk.

use std::io::Write;

use streamguard::config::{load_config, load_config_or_default, DefaultZone, VideoMode};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
        [filter]
        scan_threshold_bytes = 262144
        error_limit = 3
        video_mode = "enabled"

        [scheduler]
        initial_step_secs = 2.0
        max_step_secs = 6.0

        [zone]
        default_zone = "trusted"

        [zone.trusted]
        threshold = 0.85
        true_positives = 0.8
        false_positives = 0.01

        [watchdog]
        interval_ms = 1000
        warn_after_secs = 10
        expire_after_secs = 20

        [engine]
        backend_preference = ["wasm", "webgl"]
        "#,
    );

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.filter.scan_threshold_bytes, 262_144);
    assert_eq!(config.filter.error_limit, 3);
    assert_eq!(config.filter.video_mode, VideoMode::Enabled);
    assert_eq!(config.scheduler.initial_step_secs, 2.0);
    assert_eq!(config.zone.default_zone, DefaultZone::Trusted);
    assert_eq!(config.zone.trusted.threshold, 0.85);
    assert_eq!(config.watchdog.expire_after_secs, 20);
    assert_eq!(config.engine.primary_backend(), Some("wasm"));
    // Untouched sections keep their defaults.
    assert_eq!(config.liveness.warmup_ticks, 3);
}

#[test]
fn test_invalid_values_are_rejected() {
    let file = write_config(
        r#"
        [scheduler]
        fast_ratio = 0.8
        slow_ratio = 0.7
        "#,
    );
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("fast_ratio"));
}

#[test]
fn test_malformed_toml_is_an_error() {
    let file = write_config("[filter\nscan_threshold_bytes = ");
    assert!(load_config(file.path()).is_err());
}

#[test]
fn test_explicit_path_wins() {
    let file = write_config("[filter]\nerror_limit = 9\n");
    let config = load_config_or_default(Some(file.path())).unwrap();
    assert_eq!(config.filter.error_limit, 9);
}

#[test]
fn test_missing_explicit_path_fails() {
    assert!(load_config_or_default(Some(std::path::Path::new("/nonexistent/streamguard.toml"))).is_err());
}
