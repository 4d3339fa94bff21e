//! Per-IP sliding-window limiter for certificate downloads
//!
//! Timestamps of accepted requests are kept per client IP. A request is
//! accepted while fewer than `max_requests` accepted requests fall inside
//! the trailing window. A background sweep drops idle entries.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Sliding-window download limiter keyed by client IP
pub struct DownloadRateLimiter {
    entries: Mutex<HashMap<IpAddr, VecDeque<DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl DownloadRateLimiter {
    /// Create a limiter
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    /// Admit or reject one request from `ip`
    ///
    /// Rejected requests are not recorded.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let window_start = now - Duration::seconds(self.config.window_secs as i64);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let hits = entries.entry(ip).or_default();
        while hits.front().is_some_and(|at| *at <= window_start) {
            hits.pop_front();
        }

        if hits.len() >= self.config.max_requests {
            debug!(ip = %ip, "Download rate limit exceeded");
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Purge timestamps older than `max_entry_age`
    ///
    /// Returns the number of IPs dropped entirely.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - Duration::seconds(self.config.max_entry_age_secs as i64);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, hits| {
            while hits.front().is_some_and(|at| *at <= cutoff) {
                hits.pop_front();
            }
            !hits.is_empty()
        });
        before - entries.len()
    }

    /// Number of IPs currently tracked
    pub fn tracked(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.sweep_interval());
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = limiter.sweep();
                if dropped > 0 {
                    debug!(dropped, "Rate limiter sweep");
                }
            }
        })
    }
}
