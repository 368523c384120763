//! Per-IP fixed-window rate limiting for customer-facing commands.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct FixedWindowLimiter {
    max_attempts: u32,
    window: Duration,
    windows: DashMap<IpAddr, Window>,
}

impl FixedWindowLimiter {
    /// `max_attempts == 0` disables limiting.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn per_minute(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_secs(60))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Count an attempt from `ip`. Returns false when it is over the limit.
    pub fn record_attempt(&self, ip: IpAddr) -> bool {
        self.record_attempt_at(ip, Instant::now())
    }

    pub fn record_attempt_at(&self, ip: IpAddr, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut entry = self.windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        if entry.count >= self.max_attempts {
            return false;
        }
        entry.count += 1;
        true
    }

    pub fn remaining_attempts(&self, ip: IpAddr) -> u32 {
        self.remaining_attempts_at(ip, Instant::now())
    }

    pub fn remaining_attempts_at(&self, ip: IpAddr, now: Instant) -> u32 {
        match self.windows.get(&ip) {
            Some(w) if now.duration_since(w.started) < self.window => {
                self.max_attempts.saturating_sub(w.count)
            }
            _ => self.max_attempts,
        }
    }

    /// Forget windows that have run out. Called periodically.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
