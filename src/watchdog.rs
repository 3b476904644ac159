//! Forced completion of sessions whose stream stopped talking.
//!
//! The interception layer is expected to deliver a stop or error for every
//! response. When it does not, the session's entry ages in its
//! [`OpenFilterTable`] until the [`WatchdogMonitor`] removes it, cancels the
//! session task and reports an `error` outcome on its behalf.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use streamguard_common::{Outcome, RequestId};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;

/// Called with the outcome of every entry the watchdog expires.
pub type CompletionCallback = Arc<dyn Fn(&RequestId, Outcome) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OpenFilterEntry {
    /// When data last arrived (or the session opened).
    pub last_activity: Instant,
    pub cancel: CancellationToken,
}

/// Open sessions of one kind, as seen by the watchdog.
pub struct OpenFilterTable {
    name: &'static str,
    entries: DashMap<RequestId, OpenFilterEntry>,
    on_expire: CompletionCallback,
}

impl OpenFilterTable {
    pub fn new(name: &'static str, on_expire: CompletionCallback) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            on_expire,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Track a new session. The returned token fires if the watchdog expires it.
    pub fn open(&self, request_id: RequestId) -> CancellationToken {
        let cancel = CancellationToken::new();
        let entry = OpenFilterEntry {
            last_activity: Instant::now(),
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.entries.insert(request_id.clone(), entry) {
            tracing::warn!(table = self.name, request_id = %request_id, "Reopened filter entry");
            previous.cancel.cancel();
        }
        cancel
    }

    pub fn touch(&self, request_id: &RequestId) {
        if let Some(mut entry) = self.entries.get_mut(request_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Stop tracking a session that finished on its own.
    ///
    /// Returns false when the entry is gone, meaning the watchdog already
    /// reported the outcome and the caller must not report another.
    pub fn close(&self, request_id: &RequestId) -> bool {
        self.entries.remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, request_id: &RequestId, age: std::time::Duration) {
        if let Some(mut entry) = self.entries.get_mut(request_id) {
            entry.last_activity -= age;
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<RequestId>,
    pub watchlist: Vec<RequestId>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.expired.is_empty() && self.watchlist.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStats {
    pub kicks: u64,
    pub cleanups: u64,
}

pub struct WatchdogMonitor {
    config: WatchdogConfig,
    tables: Vec<Arc<OpenFilterTable>>,
    kicks: AtomicU64,
    cleanups: AtomicU64,
}

impl WatchdogMonitor {
    pub fn new(config: WatchdogConfig, tables: Vec<Arc<OpenFilterTable>>) -> Self {
        Self {
            config,
            tables,
            kicks: AtomicU64::new(0),
            cleanups: AtomicU64::new(0),
        }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Check every entry of every table against `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        self.kicks.fetch_add(1, Ordering::Relaxed);
        let warn_after = self.config.warn_after();
        let expire_after = self.config.expire_after();
        let mut report = SweepReport::default();

        for table in &self.tables {
            let mut stale = Vec::new();
            for entry in table.entries.iter() {
                let age = now.saturating_duration_since(entry.last_activity);
                if age >= expire_after {
                    stale.push(entry.key().clone());
                } else if age >= warn_after {
                    tracing::warn!(
                        table = table.name,
                        request_id = %entry.key(),
                        age_secs = age.as_secs(),
                        "Filter on watchlist"
                    );
                    report.watchlist.push(entry.key().clone());
                }
            }

            for request_id in stale {
                // The session may have closed or been touched since the scan.
                let removed = table.entries.remove_if(&request_id, |_, entry| {
                    now.saturating_duration_since(entry.last_activity) >= expire_after
                });
                let Some((request_id, entry)) = removed else {
                    continue;
                };
                entry.cancel.cancel();
                self.cleanups.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    table = table.name,
                    request_id = %request_id,
                    "Filter stopped receiving data; forcing error outcome"
                );
                (table.on_expire)(&request_id, Outcome::Error);
                report.expired.push(request_id);
            }
        }

        if !report.expired.is_empty() {
            let stats = self.stats();
            tracing::info!(kicks = stats.kicks, cleanups = stats.cleanups, "Watchdog cleanup");
        }
        report
    }

    pub fn stats(&self) -> WatchdogStats {
        WatchdogStats {
            kicks: self.kicks.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }

    /// Sweep on the configured interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep();
                    }
                }
            }
            tracing::debug!("Watchdog stopped");
        })
    }
}
