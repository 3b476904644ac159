//! Rolling positive-rate estimate and sensitivity zone selection.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use streamguard_common::Zone;

use crate::config::ZoneConfig;
use crate::engine::{EngineMessage, EngineRegistry};

struct ZoneState {
    /// `true` for block outcomes.
    window: VecDeque<bool>,
    block_count: usize,
    zone: Zone,
    automatic: bool,
    threshold: f64,
    precision: f64,
}

/// Observable state of the zone manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub zone: Zone,
    pub automatic: bool,
    pub threshold: f64,
    pub precision: f64,
    pub samples: usize,
    pub block_count: usize,
    pub estimate: Option<f64>,
}

/// Picks the process-wide zone from recent scoring outcomes.
///
/// Outcomes fill a fixed-capacity ring. Once enough samples exist the
/// estimated true-positive rate selects a zone; a change resets the ring
/// and pushes the new threshold to every engine.
pub struct ZoneThresholdManager {
    config: ZoneConfig,
    engines: Arc<EngineRegistry>,
    state: Mutex<ZoneState>,
}

impl ZoneThresholdManager {
    pub fn new(config: ZoneConfig, engines: Arc<EngineRegistry>) -> Self {
        let (zone, automatic) = match config.default_zone.fixed() {
            Some(zone) => (zone, false),
            None => (Zone::Neutral, true),
        };
        let roc = *config.roc(zone);
        let state = ZoneState {
            window: VecDeque::with_capacity(config.window_capacity),
            block_count: 0,
            zone,
            automatic,
            threshold: roc.threshold,
            precision: roc.precision(),
        };
        Self {
            config,
            engines,
            state: Mutex::new(state),
        }
    }

    /// Append one outcome and re-evaluate the zone.
    ///
    /// Returns the new zone when this outcome caused a transition.
    pub fn record_outcome(&self, is_block: bool) -> Option<Zone> {
        {
            let mut state = self.state.lock();
            if state.window.len() >= self.config.window_capacity
                && state.window.pop_front() == Some(true)
            {
                state.block_count -= 1;
            }
            state.window.push_back(is_block);
            if is_block {
                state.block_count += 1;
            }
        }
        self.maybe_transition()
    }

    pub fn estimate(&self) -> Option<f64> {
        let state = self.state.lock();
        self.estimate_locked(&state)
    }

    fn estimate_locked(&self, state: &ZoneState) -> Option<f64> {
        let len = state.window.len();
        if len < self.config.min_samples || len == 0 {
            return None;
        }
        Some(state.precision * state.block_count as f64 / len as f64)
    }

    fn zone_for(&self, estimate: f64) -> Zone {
        if estimate < self.config.trusted_cutoff {
            Zone::Trusted
        } else if estimate < self.config.untrusted_cutoff {
            Zone::Neutral
        } else {
            Zone::Untrusted
        }
    }

    /// Switch zones if automatic mode is on and the estimate calls for it.
    pub fn maybe_transition(&self) -> Option<Zone> {
        let (zone, threshold, estimate) = {
            let mut state = self.state.lock();
            if !state.automatic {
                return None;
            }
            let estimate = self.estimate_locked(&state)?;
            let zone = self.zone_for(estimate);
            if zone == state.zone {
                return None;
            }
            let threshold = self.apply_locked(&mut state, zone);
            (zone, threshold, estimate)
        };

        tracing::info!(zone = %zone, threshold, estimate, "Zone changed");
        self.broadcast_threshold(threshold);
        Some(zone)
    }

    /// Enter a zone explicitly. The ring is reset even if the zone is unchanged.
    pub fn set_zone(&self, zone: Zone) {
        let threshold = {
            let mut state = self.state.lock();
            self.apply_locked(&mut state, zone)
        };
        tracing::info!(zone = %zone, threshold, "Zone set");
        self.broadcast_threshold(threshold);
    }

    /// Turn automatic transitions on or off. Recording continues either way.
    pub fn set_automatic(&self, automatic: bool) {
        self.state.lock().automatic = automatic;
        tracing::info!(automatic, "Zone mode changed");
    }

    pub fn zone(&self) -> Zone {
        self.state.lock().zone
    }

    pub fn threshold(&self) -> f64 {
        self.state.lock().threshold
    }

    pub fn is_automatic(&self) -> bool {
        self.state.lock().automatic
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().window.len()
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        let state = self.state.lock();
        ZoneSnapshot {
            zone: state.zone,
            automatic: state.automatic,
            threshold: state.threshold,
            precision: state.precision,
            samples: state.window.len(),
            block_count: state.block_count,
            estimate: self.estimate_locked(&state),
        }
    }

    fn apply_locked(&self, state: &mut ZoneState, zone: Zone) -> f64 {
        let roc = self.config.roc(zone);
        state.zone = zone;
        state.threshold = roc.threshold;
        state.precision = roc.precision();
        state.window.clear();
        state.block_count = 0;
        state.threshold
    }

    fn broadcast_threshold(&self, threshold: f64) {
        let delivered = self
            .engines
            .broadcast(&EngineMessage::ThresholdChange { threshold });
        tracing::debug!(threshold, delivered, "Broadcast threshold change");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultZone;
    use crate::engine::ChannelEngine;

    fn manager(default_zone: DefaultZone) -> ZoneThresholdManager {
        let config = ZoneConfig {
            default_zone,
            ..Default::default()
        };
        ZoneThresholdManager::new(config, Arc::new(EngineRegistry::new(vec!["webgl".into()])))
    }

    #[test]
    fn test_automatic_starts_neutral() {
        let zones = manager(DefaultZone::Automatic);
        assert_eq!(zones.zone(), Zone::Neutral);
        assert!(zones.is_automatic());
        assert_eq!(zones.threshold(), 0.60);

        let fixed = manager(DefaultZone::Untrusted);
        assert_eq!(fixed.zone(), Zone::Untrusted);
        assert!(!fixed.is_automatic());
    }

    #[test]
    fn test_estimate_needs_min_samples() {
        let zones = manager(DefaultZone::Untrusted);
        for _ in 0..49 {
            zones.record_outcome(true);
        }
        assert_eq!(zones.estimate(), None);
        zones.record_outcome(true);
        let estimate = zones.estimate().unwrap();
        assert!((0.0..=1.0).contains(&estimate));
    }

    #[test]
    fn test_ring_caps_at_capacity() {
        let zones = manager(DefaultZone::Neutral);
        for _ in 0..50 {
            zones.record_outcome(true);
        }
        for _ in 0..250 {
            zones.record_outcome(false);
        }
        let snapshot = zones.snapshot();
        assert_eq!(snapshot.samples, 200);
        assert_eq!(snapshot.block_count, 0);
    }

    #[test]
    fn test_oldest_sample_is_evicted() {
        let zones = manager(DefaultZone::Neutral);
        zones.record_outcome(true);
        for _ in 0..199 {
            zones.record_outcome(false);
        }
        assert_eq!(zones.snapshot().block_count, 1);
        zones.record_outcome(false);
        assert_eq!(zones.snapshot().block_count, 0);
    }

    #[test]
    fn test_low_block_rate_moves_to_trusted() {
        let registry = Arc::new(EngineRegistry::new(vec!["webgl".into()]));
        let (engine, mut rx) = ChannelEngine::new("w1");
        registry.connect(Arc::new(engine));
        let zones = ZoneThresholdManager::new(ZoneConfig::default(), registry);

        let mut changed = None;
        for _ in 0..50 {
            changed = changed.or(zones.record_outcome(false));
        }
        assert_eq!(changed, Some(Zone::Trusted));
        assert_eq!(zones.sample_count(), 0);
        assert_eq!(zones.threshold(), 0.80);
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineMessage::ThresholdChange { threshold }) if threshold == 0.80
        ));
    }

    #[test]
    fn test_high_block_rate_moves_to_untrusted() {
        let zones = manager(DefaultZone::Automatic);
        let mut changed = None;
        for i in 0..50 {
            changed = changed.or(zones.record_outcome(i % 5 == 0));
        }
        assert_eq!(changed, Some(Zone::Untrusted));
        assert_eq!(zones.snapshot().samples, 0);
    }

    #[test]
    fn test_manual_mode_records_without_switching() {
        let zones = manager(DefaultZone::Automatic);
        zones.set_automatic(false);
        for _ in 0..60 {
            assert_eq!(zones.record_outcome(false), None);
        }
        assert_eq!(zones.zone(), Zone::Neutral);
        assert!(zones.estimate().is_some());
    }

    #[test]
    fn test_set_zone_resets_window() {
        let zones = manager(DefaultZone::Automatic);
        for _ in 0..10 {
            zones.record_outcome(true);
        }
        zones.set_zone(Zone::Untrusted);
        let snapshot = zones.snapshot();
        assert_eq!(snapshot.zone, Zone::Untrusted);
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.threshold, 0.40);
    }
}
