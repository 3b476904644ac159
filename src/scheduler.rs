//! Scan cadence control.

use std::time::Duration;

use crate::config::SchedulerConfig;

/// Direction of the last step adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepChange {
    Widened,
    Narrowed,
    Unchanged,
}

/// Chooses where the next scan round samples a stream, and how densely.
///
/// The step (media seconds between sampled frames) widens when the engine
/// falls behind and narrows when it has headroom. Sampling resumes after
/// the media time already covered, so rounds over a growing prefix do not
/// re-score the same frames.
#[derive(Debug, Clone)]
pub struct AdaptiveScanScheduler {
    config: SchedulerConfig,
    step: f64,
    start: f64,
    next_start: f64,
}

impl AdaptiveScanScheduler {
    pub fn new(config: SchedulerConfig, start_secs: f64) -> Self {
        let step = config
            .initial_step_secs
            .clamp(config.min_step_secs, config.max_step_secs);
        Self {
            config,
            step,
            start: start_secs,
            next_start: start_secs,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Media time the next round starts sampling at.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Media seconds covered by completed rounds.
    pub fn covered_secs(&self) -> f64 {
        self.next_start - self.start
    }

    /// Account for media time a completed round covered.
    pub fn advance(&mut self, secs: f64) {
        self.next_start += secs.max(0.0);
    }

    /// Adjust the step from the observed latency of one round.
    pub fn record_latency(&mut self, elapsed: Duration, scan_count: u32) -> StepChange {
        let per_item = elapsed.as_secs_f64() / scan_count.max(1) as f64;
        self.adjust(per_item)
    }

    pub fn adjust(&mut self, latency_per_item: f64) -> StepChange {
        let before = self.step;
        if latency_per_item > self.config.slow_ratio * self.step {
            self.step = (self.step + self.config.step_increment_secs).min(self.config.max_step_secs);
        } else if latency_per_item < self.config.fast_ratio * self.step {
            self.step = (self.step - self.config.step_increment_secs).max(self.config.min_step_secs);
        }

        let change = if self.step > before {
            StepChange::Widened
        } else if self.step < before {
            StepChange::Narrowed
        } else {
            StepChange::Unchanged
        };
        if change != StepChange::Unchanged {
            tracing::debug!(latency_per_item, from = before, to = self.step, "Scan step adjusted");
        }
        change
    }
}
