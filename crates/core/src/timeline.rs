use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Errors creating a sync timeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimelineError {
    #[error("failed to create a sync timeline: {0}")]
    CreateFailed(String),
}

struct Counters {
    issued: u64,
    signaled: u64,
}

struct TimelineInner {
    counters: Mutex<Counters>,
    ready: Condvar,
}

impl TimelineInner {
    fn signal_up_to(&self, target: u64) {
        let mut counters = self.counters.lock();
        if counters.signaled < target {
            counters.signaled = target;
            self.ready.notify_all();
        }
    }
}

/// Per-client monotonic sync timeline.
///
/// A timeline carries two counters: `issued` advances whenever a fence is
/// minted, `signaled` advances to release fences. A fence bound at issuance
/// count `n` becomes ready once `signaled >= n`.
///
/// Dropping the timeline force-signals every outstanding fence so that no
/// waiter is stranded.
///
/// # Example
/// ```rust
/// use evsmux_core::prelude::Timeline;
///
/// let timeline = Timeline::new();
/// timeline.bump_issuance();
/// let fence = timeline.create_fence();
/// assert!(!fence.is_ready());
/// timeline.bump_signal();
/// assert!(fence.is_ready());
/// ```
pub struct Timeline {
    inner: Arc<TimelineInner>,
}

impl Timeline {
    /// Create a timeline with both counters at zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimelineInner {
                counters: Mutex::new(Counters {
                    issued: 0,
                    signaled: 0,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Mint a fence bound to the current issuance count.
    pub fn create_fence(&self) -> Fence {
        let target = self.inner.counters.lock().issued;
        Fence {
            target,
            inner: self.inner.clone(),
        }
    }

    /// Advance the fence-issuance side.
    pub fn bump_issuance(&self) {
        self.inner.counters.lock().issued += 1;
    }

    /// Advance the signal side, releasing every fence at or below the new count.
    pub fn bump_signal(&self) {
        let mut counters = self.inner.counters.lock();
        counters.signaled += 1;
        self.inner.ready.notify_all();
    }

    /// Release all outstanding fences by raising the signal count to the
    /// issuance count.
    pub fn force_signal(&self) {
        let target = self.inner.counters.lock().issued;
        self.inner.signal_up_to(target);
    }

    /// Current issuance count.
    pub fn issued(&self) -> u64 {
        self.inner.counters.lock().issued
    }

    /// Current signal count.
    pub fn signaled(&self) -> u64 {
        self.inner.counters.lock().signaled
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.force_signal();
    }
}

/// Duplicable handle bound to a timeline issuance count.
///
/// Cloning is a cheap reference-count bump; every duplicate observes the same
/// readiness.
#[derive(Clone)]
pub struct Fence {
    target: u64,
    inner: Arc<TimelineInner>,
}

impl Fence {
    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        self.inner.counters.lock().signaled >= self.target
    }

    /// Block until the fence is ready or the timeout elapses.
    ///
    /// Returns `true` when the fence became ready.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counters = self.inner.counters.lock();
        while counters.signaled < self.target {
            if self
                .inner
                .ready
                .wait_until(&mut counters, deadline)
                .timed_out()
            {
                return counters.signaled >= self.target;
            }
        }
        true
    }

    /// Issuance count this fence is bound to.
    pub fn target(&self) -> u64 {
        self.target
    }
}

/// Source of sync timelines.
///
/// The multiplexer goes through this seam so that an environment without a
/// usable sync primitive can surface `CreateFailed` and let clients fall back
/// to pull-mode delivery.
pub trait FenceFactory: Send + Sync {
    fn create_timeline(&self) -> Result<Timeline, TimelineError>;
}

/// Process-local timelines; creation always succeeds.
pub struct SoftwareFences;

impl FenceFactory for SoftwareFences {
    fn create_timeline(&self) -> Result<Timeline, TimelineError> {
        Ok(Timeline::new())
    }
}
