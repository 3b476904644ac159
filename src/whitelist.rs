//! URLs that are never filtered.
//!
//! Permanent entries are URL prefixes from config. Temporary entries are
//! exact URLs that stay whitelisted for a short TTL, e.g. to let a single
//! reload through after the user asked to reveal it.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::FilterConfig;

pub struct UrlWhitelist {
    stems: Vec<String>,
    temporary: DashMap<String, Instant>,
    ttl: Duration,
}

impl UrlWhitelist {
    pub fn new(stems: Vec<String>, ttl: Duration) -> Self {
        Self {
            stems,
            temporary: DashMap::new(),
            ttl,
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.whitelist_stems.clone(), config.temporary_whitelist_ttl())
    }

    /// Whitelist `url` for the default TTL.
    pub fn add_temporary(&self, url: impl Into<String>) {
        self.add_temporary_for(url, self.ttl);
    }

    pub fn add_temporary_for(&self, url: impl Into<String>, ttl: Duration) {
        let url = url.into();
        tracing::debug!(url = %url, ttl_ms = ttl.as_millis() as u64, "Added temporary whitelist entry");
        self.temporary.insert(url, Instant::now() + ttl);
    }

    /// Expired temporary entries are dropped on every check.
    pub fn is_whitelisted(&self, url: &str) -> bool {
        let now = Instant::now();
        self.temporary.retain(|_, expires_at| *expires_at > now);
        self.stems.iter().any(|stem| url.starts_with(stem.as_str()))
            || self.temporary.contains_key(url)
    }

    pub fn temporary_len(&self) -> usize {
        self.temporary.len()
    }
}
