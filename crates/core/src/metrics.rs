use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight delivery counters for one multiplexed camera.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::MuxStats;
///
/// let stats = MuxStats::default();
/// stats.record_received();
/// assert_eq!(stats.frames_received(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MuxStats {
    frames_received: AtomicU64,
    frames_not_used: AtomicU64,
    sync_skips: AtomicU64,
}

impl MuxStats {
    /// Count one frame arriving from hardware.
    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one frame no client accepted.
    pub fn record_not_used(&self) {
        self.frames_not_used.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one fenced request re-queued because the frame arrived too soon.
    pub fn record_sync_skip(&self) {
        self.sync_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_not_used(&self) -> u64 {
        self.frames_not_used.load(Ordering::Relaxed)
    }

    pub fn sync_skips(&self) -> u64 {
        self.sync_skips.load(Ordering::Relaxed)
    }
}

impl Clone for MuxStats {
    fn clone(&self) -> Self {
        let cloned = MuxStats::default();
        cloned
            .frames_received
            .store(self.frames_received(), Ordering::Relaxed);
        cloned
            .frames_not_used
            .store(self.frames_not_used(), Ordering::Relaxed);
        cloned.sync_skips.store(self.sync_skips(), Ordering::Relaxed);
        cloned
    }
}
