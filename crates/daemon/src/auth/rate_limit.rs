//! Sliding-window attempt throttling keyed by source.
//!
//! One [`RateLimiter`] is shared by the web login and the SFTP password
//! handshake. The attempt map never leaves this type; callers only see
//! [`check_and_record`](RateLimiter::check_and_record) and
//! [`reset`](RateLimiter::reset).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Throttling state for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    pub count: u32,
    pub window_start: Instant,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    denial_delay: Duration,
    records: Mutex<HashMap<String, AttemptRecord>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            denial_delay: Duration::ZERO,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_attempts, config.window()).with_denial_delay(config.denial_delay())
    }

    /// Delay applied by [`admit`](Self::admit) to denied attempts.
    pub fn with_denial_delay(mut self, delay: Duration) -> Self {
        self.denial_delay = delay;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check_and_record(&self, source: &str) -> bool {
        self.check_and_record_at(source, Instant::now())
    }

    /// Record one attempt from `source` and report whether it is admitted.
    pub fn check_and_record_at(&self, source: &str, now: Instant) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        match records.get_mut(source) {
            Some(record) if now.saturating_duration_since(record.window_start) <= self.window => {
                record.count = record.count.saturating_add(1);
                record.last_seen = now;
                record.count <= self.max_attempts
            }
            _ => {
                records.insert(
                    source.to_string(),
                    AttemptRecord {
                        count: 1,
                        window_start: now,
                        last_seen: now,
                    },
                );
                self.max_attempts >= 1
            }
        }
    }

    /// [`check_and_record`](Self::check_and_record), sleeping before
    /// returning a denial.
    pub async fn admit(&self, source: &str) -> bool {
        let allowed = self.check_and_record(source);
        if !allowed {
            warn!(source = %source, "Attempt rate limit exceeded");
            if !self.denial_delay.is_zero() {
                tokio::time::sleep(self.denial_delay).await;
            }
        }
        allowed
    }

    /// Forget `source`, called after a successful authentication.
    pub fn reset(&self, source: &str) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.remove(source).is_some() {
            debug!(source = %source, "Cleared attempt record");
        }
    }

    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Drop records idle for longer than the window. Returns how many.
    pub fn prune_at(&self, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| now.saturating_duration_since(record.last_seen) <= self.window);
        before - records.len()
    }

    /// Current record for `source`.
    pub fn record(&self, source: &str) -> Option<AttemptRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(source).copied()
    }

    pub fn tracked_sources(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
