//! Host-driven sweep scheduling.
//!
//! The collector never owns an event loop. When an incremental sweep
//! starts, the heap arms the host's periodic timer; the host then calls
//! [`Heap::sweep_on_timer`](crate::heap::Heap::sweep_on_timer) on every
//! firing until the heap disarms it.

use std::time::Duration;

/// Interval the heap requests between sweep slices.
pub const SWEEP_TIMER_INTERVAL: Duration = Duration::from_millis(16);

/// A periodic timer supplied by the host event loop.
///
/// `arm` may be called while already armed (a no-op restart is fine);
/// `disarm` while disarmed likewise.
pub trait SweepTimer {
    /// Start firing every `interval` until disarmed.
    fn arm(&mut self, interval: Duration);

    /// Stop firing.
    fn disarm(&mut self);
}

/// Timer for hosts and tests that drive sweeping manually, by calling
/// [`Heap::sweep_on_timer`](crate::heap::Heap::sweep_on_timer) themselves.
#[derive(Debug, Default)]
pub struct NullTimer {
    armed: bool,
}

impl NullTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the heap currently wants firings.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }
}

impl SweepTimer for NullTimer {
    fn arm(&mut self, _interval: Duration) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}
