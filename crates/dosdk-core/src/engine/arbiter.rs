//! Foreground / background bandwidth arbitration
//!
//! Every byte goes through the global limiter. Background transfers also go
//! through a background limiter, which tightens while at least one foreground
//! transfer is running.

use crate::engine::RateLimiter;
use dosdk_types::LocalServiceSettings;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Scheduling class of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Foreground,
    Background,
}

impl Priority {
    pub fn from_foreground_flag(foreground: bool) -> Self {
        if foreground {
            Priority::Foreground
        } else {
            Priority::Background
        }
    }
}

#[derive(Clone)]
pub struct BandwidthArbiter {
    global: RateLimiter,
    background: RateLimiter,
    foreground_active: Arc<AtomicUsize>,
    background_limit: u64,
    contended_limit: u64,
}

impl BandwidthArbiter {
    pub fn new(settings: &LocalServiceSettings) -> Self {
        Self {
            global: RateLimiter::new(settings.max_bandwidth_bps),
            background: RateLimiter::new(settings.background_limit_bps),
            foreground_active: Arc::new(AtomicUsize::new(0)),
            background_limit: settings.background_limit_bps,
            contended_limit: effective_limit(
                settings.background_limit_bps,
                settings.contended_background_limit_bps,
            ),
        }
    }

    /// Register a running transfer; the guard unregisters it on drop
    pub fn enter(&self, priority: Priority) -> PriorityGuard {
        if priority == Priority::Foreground
            && self.foreground_active.fetch_add(1, Ordering::AcqRel) == 0
        {
            debug!("Foreground transfer active, background limited to {} B/s", self.contended_limit);
            self.background.set_limit(self.contended_limit);
        }

        PriorityGuard {
            arbiter: self.clone(),
            priority,
        }
    }

    /// Wait until `bytes` of the given class may be transferred
    pub async fn acquire(&self, priority: Priority, bytes: u64) {
        if priority == Priority::Background {
            self.background.acquire(bytes).await;
        }
        self.global.acquire(bytes).await;
    }

    pub fn foreground_active(&self) -> usize {
        self.foreground_active.load(Ordering::Acquire)
    }

    pub fn background_limit(&self) -> Option<u64> {
        self.background.limit()
    }
}

pub struct PriorityGuard {
    arbiter: BandwidthArbiter,
    priority: Priority,
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        if self.priority == Priority::Foreground
            && self.arbiter.foreground_active.fetch_sub(1, Ordering::AcqRel) == 1
        {
            debug!("No foreground transfer left, restoring background limit");
            self.arbiter.background.set_limit(self.arbiter.background_limit);
        }
    }
}

/// Tighter of two limits where 0 means unlimited
fn effective_limit(base: u64, contended: u64) -> u64 {
    match (base, contended) {
        (0, c) => c,
        (b, 0) => b,
        (b, c) => b.min(c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(background: u64, contended: u64) -> LocalServiceSettings {
        LocalServiceSettings {
            background_limit_bps: background,
            contended_background_limit_bps: contended,
            ..LocalServiceSettings::default()
        }
    }

    #[test]
    fn test_foreground_tightens_background() {
        let arbiter = BandwidthArbiter::new(&settings(0, 4096));
        assert_eq!(arbiter.background_limit(), None);

        let first = arbiter.enter(Priority::Foreground);
        let second = arbiter.enter(Priority::Foreground);
        assert_eq!(arbiter.foreground_active(), 2);
        assert_eq!(arbiter.background_limit(), Some(4096));

        drop(first);
        assert_eq!(arbiter.background_limit(), Some(4096));
        drop(second);
        assert_eq!(arbiter.background_limit(), None);
    }

    #[test]
    fn test_background_entry_does_not_contend() {
        let arbiter = BandwidthArbiter::new(&settings(8192, 4096));
        let _guard = arbiter.enter(Priority::Background);
        assert_eq!(arbiter.foreground_active(), 0);
        assert_eq!(arbiter.background_limit(), Some(8192));
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(effective_limit(0, 0), 0);
        assert_eq!(effective_limit(0, 10), 10);
        assert_eq!(effective_limit(10, 0), 10);
        assert_eq!(effective_limit(20, 10), 10);
    }
}
