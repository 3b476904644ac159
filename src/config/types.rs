use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use streamguard_common::Zone;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub zone: ZoneConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// How video responses are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    /// Scan every video response.
    Enabled,
    /// Scan with the shorter fragment budget.
    #[default]
    Quick,
    /// Let video through untouched.
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Bytes accumulated since the last scan that trigger the next scan
    #[serde(default = "default_scan_threshold")]
    pub scan_threshold_bytes: u64,

    /// Scanned bytes after which the rest of the stream passes unscanned
    #[serde(default = "default_full_pass_bytes")]
    pub full_pass_bytes: u64,

    /// Scanned media seconds after which the rest of the stream passes unscanned
    #[serde(default = "default_full_pass_duration")]
    pub full_pass_duration_secs: u64,

    /// Scan errors tolerated before failing open
    #[serde(default = "default_error_limit")]
    pub error_limit: u32,

    #[serde(default = "default_scan_block_bail")]
    pub scan_block_bail_count: u32,

    #[serde(default = "default_fragment_block_bail")]
    pub fragment_block_bail_count: u32,

    /// Blocked frames that block an image outright
    #[serde(default = "default_image_block_bail")]
    pub image_block_bail_count: u32,

    /// Media time of the first sampled frame
    #[serde(default = "default_scan_start")]
    pub scan_start_secs: f64,

    #[serde(default = "default_scan_max_steps")]
    pub scan_max_steps: u32,

    #[serde(default = "default_fragment_scan_max_steps")]
    pub fragment_scan_max_steps: u32,

    /// Replacement payload for blocked responses (empty when unset)
    #[serde(default)]
    pub placeholder_path: Option<PathBuf>,

    #[serde(default)]
    pub video_mode: VideoMode,

    /// URL prefixes that are never filtered
    #[serde(default = "default_whitelist_stems")]
    pub whitelist_stems: Vec<String>,

    #[serde(default = "default_temporary_whitelist_ttl")]
    pub temporary_whitelist_ttl_ms: u64,
}

impl FilterConfig {
    pub fn temporary_whitelist_ttl(&self) -> Duration {
        Duration::from_millis(self.temporary_whitelist_ttl_ms)
    }
}

fn default_scan_threshold() -> u64 {
    500 * 1024
}
fn default_full_pass_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_full_pass_duration() -> u64 {
    10 * 60
}
fn default_error_limit() -> u32 {
    5
}
fn default_scan_block_bail() -> u32 {
    3
}
fn default_fragment_block_bail() -> u32 {
    4
}
fn default_image_block_bail() -> u32 {
    1
}
fn default_scan_start() -> f64 {
    0.5
}
fn default_scan_max_steps() -> u32 {
    30
}
fn default_fragment_scan_max_steps() -> u32 {
    10
}
fn default_whitelist_stems() -> Vec<String> {
    vec![
        "https://www.google.com/recaptcha".to_string(),
        "https://www.gstatic.com/recaptcha".to_string(),
    ]
}
fn default_temporary_whitelist_ttl() -> u64 {
    10_000
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            scan_threshold_bytes: default_scan_threshold(),
            full_pass_bytes: default_full_pass_bytes(),
            full_pass_duration_secs: default_full_pass_duration(),
            error_limit: default_error_limit(),
            scan_block_bail_count: default_scan_block_bail(),
            fragment_block_bail_count: default_fragment_block_bail(),
            image_block_bail_count: default_image_block_bail(),
            scan_start_secs: default_scan_start(),
            scan_max_steps: default_scan_max_steps(),
            fragment_scan_max_steps: default_fragment_scan_max_steps(),
            placeholder_path: None,
            video_mode: VideoMode::default(),
            whitelist_stems: default_whitelist_stems(),
            temporary_whitelist_ttl_ms: default_temporary_whitelist_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_initial_step")]
    pub initial_step_secs: f64,

    #[serde(default = "default_min_step")]
    pub min_step_secs: f64,

    #[serde(default = "default_max_step")]
    pub max_step_secs: f64,

    #[serde(default = "default_step_increment")]
    pub step_increment_secs: f64,

    /// Latency per item above this fraction of the step widens the step
    #[serde(default = "default_slow_ratio")]
    pub slow_ratio: f64,

    /// Latency per item below this fraction of the step narrows the step
    #[serde(default = "default_fast_ratio")]
    pub fast_ratio: f64,
}

fn default_initial_step() -> f64 {
    1.0
}
fn default_min_step() -> f64 {
    0.5
}
fn default_max_step() -> f64 {
    10.0
}
fn default_step_increment() -> f64 {
    0.5
}
fn default_slow_ratio() -> f64 {
    0.70
}
fn default_fast_ratio() -> f64 {
    0.35
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_step_secs: default_initial_step(),
            min_step_secs: default_min_step(),
            max_step_secs: default_max_step(),
            step_increment_secs: default_step_increment(),
            slow_ratio: default_slow_ratio(),
            fast_ratio: default_fast_ratio(),
        }
    }
}

/// Startup zone selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultZone {
    /// Automatic transitions, starting at neutral.
    #[default]
    Automatic,
    Trusted,
    Neutral,
    Untrusted,
}

impl DefaultZone {
    /// The fixed zone to start in, or `None` for automatic mode.
    pub fn fixed(self) -> Option<Zone> {
        match self {
            Self::Automatic => None,
            Self::Trusted => Some(Zone::Trusted),
            Self::Neutral => Some(Zone::Neutral),
            Self::Untrusted => Some(Zone::Untrusted),
        }
    }
}

/// A point on a precomputed ROC curve.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RocPoint {
    /// Score threshold sent to the scoring engine.
    pub threshold: f64,
    pub true_positives: f64,
    pub false_positives: f64,
}

impl RocPoint {
    /// Fraction of positive predictions that are true positives.
    pub fn precision(&self) -> f64 {
        let predicted = self.true_positives + self.false_positives;
        if predicted <= 0.0 {
            0.0
        } else {
            self.true_positives / predicted
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoneConfig {
    #[serde(default)]
    pub default_zone: DefaultZone,

    /// Estimates below this select the trusted zone
    #[serde(default = "default_trusted_cutoff")]
    pub trusted_cutoff: f64,

    /// Estimates at or above this select the untrusted zone
    #[serde(default = "default_untrusted_cutoff")]
    pub untrusted_cutoff: f64,

    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Samples required before the estimate is valid
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_trusted_roc")]
    pub trusted: RocPoint,

    #[serde(default = "default_neutral_roc")]
    pub neutral: RocPoint,

    #[serde(default = "default_untrusted_roc")]
    pub untrusted: RocPoint,
}

fn default_trusted_cutoff() -> f64 {
    0.01
}
fn default_untrusted_cutoff() -> f64 {
    0.04
}
fn default_window_capacity() -> usize {
    200
}
fn default_min_samples() -> usize {
    50
}
fn default_trusted_roc() -> RocPoint {
    RocPoint {
        threshold: 0.80,
        true_positives: 0.83,
        false_positives: 0.02,
    }
}
fn default_neutral_roc() -> RocPoint {
    RocPoint {
        threshold: 0.60,
        true_positives: 0.89,
        false_positives: 0.05,
    }
}
fn default_untrusted_roc() -> RocPoint {
    RocPoint {
        threshold: 0.40,
        true_positives: 0.94,
        false_positives: 0.12,
    }
}

impl ZoneConfig {
    pub fn roc(&self, zone: Zone) -> &RocPoint {
        match zone {
            Zone::Trusted => &self.trusted,
            Zone::Neutral => &self.neutral,
            Zone::Untrusted => &self.untrusted,
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            default_zone: DefaultZone::default(),
            trusted_cutoff: default_trusted_cutoff(),
            untrusted_cutoff: default_untrusted_cutoff(),
            window_capacity: default_window_capacity(),
            min_samples: default_min_samples(),
            trusted: default_trusted_roc(),
            neutral: default_neutral_roc(),
            untrusted: default_untrusted_roc(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_warn_after")]
    pub warn_after_secs: u64,

    #[serde(default = "default_expire_after")]
    pub expire_after_secs: u64,
}

fn default_watchdog_interval() -> u64 {
    2500
}
fn default_warn_after() -> u64 {
    30
}
fn default_expire_after() -> u64 {
    45
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn warn_after(&self) -> Duration {
        Duration::from_secs(self.warn_after_secs)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_secs)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_watchdog_interval(),
            warn_after_secs: default_warn_after(),
            expire_after_secs: default_expire_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_interval")]
    pub interval_ms: u64,

    /// Ticks are skipped while the host has been idle this long
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,

    #[serde(default = "default_warmup_ticks")]
    pub warmup_ticks: u32,

    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_mismatch_threshold")]
    pub mismatch_restart_threshold: u32,

    #[serde(default = "default_no_engine_threshold")]
    pub no_engine_restart_threshold: u32,

    /// Known-answer payload pushed through the engine each tick
    #[serde(default)]
    pub probe_path: Option<PathBuf>,
}

fn default_liveness_interval() -> u64 {
    7500
}
fn default_idle_secs() -> u64 {
    3 * 60
}
fn default_warmup_ticks() -> u32 {
    3
}
fn default_tolerance() -> f64 {
    0.02
}
fn default_mismatch_threshold() -> u32 {
    2
}
fn default_no_engine_threshold() -> u32 {
    3
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_liveness_interval(),
            idle_secs: default_idle_secs(),
            warmup_ticks: default_warmup_ticks(),
            tolerance: default_tolerance(),
            mismatch_restart_threshold: default_mismatch_threshold(),
            no_engine_restart_threshold: default_no_engine_threshold(),
            probe_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Scoring backends in order of preference; only the first is used
    #[serde(default = "default_backend_preference")]
    pub backend_preference: Vec<String>,
}

fn default_backend_preference() -> Vec<String> {
    vec!["webgl".to_string()]
}

impl EngineConfig {
    pub fn primary_backend(&self) -> Option<&str> {
        self.backend_preference.first().map(String::as_str)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_preference: default_backend_preference(),
        }
    }
}
