mod types;

pub use types::*;

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./streamguard.toml",
        "~/.config/streamguard/config.toml",
        "/etc/streamguard/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Read an optional payload file, expanding `~`.
pub fn load_payload(path: Option<&Path>) -> Result<Bytes> {
    let Some(path) = path else {
        return Ok(Bytes::new());
    };
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    let data = std::fs::read(&expanded)
        .with_context(|| format!("Failed to read payload file: {}", expanded))?;
    Ok(Bytes::from(data))
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let filter = &config.filter;
    if filter.scan_threshold_bytes == 0 {
        anyhow::bail!("filter.scan_threshold_bytes cannot be 0");
    }
    if filter.scan_block_bail_count == 0
        || filter.fragment_block_bail_count == 0
        || filter.image_block_bail_count == 0
    {
        anyhow::bail!("filter block bail counts must be at least 1");
    }

    let scheduler = &config.scheduler;
    if scheduler.min_step_secs <= 0.0 {
        anyhow::bail!("scheduler.min_step_secs must be positive");
    }
    if scheduler.min_step_secs > scheduler.max_step_secs {
        anyhow::bail!(
            "scheduler.min_step_secs ({}) exceeds max_step_secs ({})",
            scheduler.min_step_secs,
            scheduler.max_step_secs
        );
    }
    if scheduler.step_increment_secs <= 0.0 {
        anyhow::bail!("scheduler.step_increment_secs must be positive");
    }
    if scheduler.fast_ratio >= scheduler.slow_ratio {
        anyhow::bail!(
            "scheduler.fast_ratio ({}) must be below slow_ratio ({})",
            scheduler.fast_ratio,
            scheduler.slow_ratio
        );
    }

    let zone = &config.zone;
    if zone.trusted_cutoff > zone.untrusted_cutoff {
        anyhow::bail!(
            "zone.trusted_cutoff ({}) exceeds untrusted_cutoff ({})",
            zone.trusted_cutoff,
            zone.untrusted_cutoff
        );
    }
    if zone.window_capacity == 0 || zone.min_samples > zone.window_capacity {
        anyhow::bail!(
            "zone.min_samples ({}) must fit in a non-empty window ({})",
            zone.min_samples,
            zone.window_capacity
        );
    }
    for (name, roc) in [
        ("trusted", &zone.trusted),
        ("neutral", &zone.neutral),
        ("untrusted", &zone.untrusted),
    ] {
        if roc.true_positives + roc.false_positives <= 0.0 {
            anyhow::bail!("zone.{} ROC point has no positive predictions", name);
        }
    }

    let watchdog = &config.watchdog;
    if watchdog.interval_ms == 0 {
        anyhow::bail!("watchdog.interval_ms cannot be 0");
    }
    if watchdog.warn_after_secs >= watchdog.expire_after_secs {
        anyhow::bail!(
            "watchdog.warn_after_secs ({}) must be below expire_after_secs ({})",
            watchdog.warn_after_secs,
            watchdog.expire_after_secs
        );
    }

    if config.liveness.interval_ms == 0 {
        anyhow::bail!("liveness.interval_ms cannot be 0");
    }

    if config.engine.backend_preference.is_empty() {
        tracing::warn!("No scoring backend preference configured; every scan will fail open");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.filter.scan_threshold_bytes, 512_000);
        assert_eq!(config.watchdog.interval_ms, 2500);
        assert_eq!(config.engine.primary_backend(), Some("webgl"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [filter]
            video_mode = "disabled"

            [zone]
            default_zone = "untrusted"
            "#,
        )
        .unwrap();
        assert_eq!(config.filter.video_mode, VideoMode::Disabled);
        assert_eq!(config.filter.error_limit, 5);
        assert_eq!(config.zone.default_zone, DefaultZone::Untrusted);
        assert_eq!(config.zone.window_capacity, 200);
    }

    #[test]
    fn test_rejects_inverted_scheduler_bounds() {
        let mut config = Config::default();
        config.scheduler.min_step_secs = 5.0;
        config.scheduler.max_step_secs = 1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_inverted_watchdog_ages() {
        let mut config = Config::default();
        config.watchdog.warn_after_secs = 45;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_empty_roc_point() {
        let mut config = Config::default();
        config.zone.neutral.true_positives = 0.0;
        config.zone.neutral.false_positives = 0.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_roc_precision() {
        let roc = RocPoint {
            threshold: 0.5,
            true_positives: 0.9,
            false_positives: 0.1,
        };
        assert!((roc.precision() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_missing_payload_is_empty() {
        assert!(load_payload(None).unwrap().is_empty());
    }
}
