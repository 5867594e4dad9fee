//! Monotonic millisecond time base shared by the coordinator and playback

use std::time::{Duration, Instant};

/// Milliseconds elapsed since a fixed process-local origin.
///
/// Clock-sync probes and playback timestamps are plain `f64` milliseconds on
/// this base so they can be compared, subtracted and sent over the wire.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn with_origin(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn now_ms(&self) -> f64 {
        self.to_ms(Instant::now())
    }

    /// Convert an instant to milliseconds since the origin (0 if earlier)
    pub fn to_ms(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.origin).as_secs_f64() * 1000.0
    }

    pub fn to_instant(&self, ms: f64) -> Instant {
        self.origin + Duration::from_secs_f64(ms.max(0.0) / 1000.0)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
