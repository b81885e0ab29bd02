// src/clock.rs
//! Time sources and suspension detection.
//!
//! The engine reads two clocks: wall (realtime) and monotonic. Both go
//! through the [`Clock`] trait so tests can drive the engine with a
//! scripted clock. [`SuspensionDetector`] compares the two clocks
//! between ticks to detect that the host was suspended: across a
//! suspend/resume cycle the wall clock jumps while the monotonic clock
//! barely moves.

use std::time::Instant;

/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;

/// A source of wall and monotonic time, in microseconds.
pub trait Clock: Send + Sync {
    /// Wall-clock time as microseconds since the Unix epoch.
    fn realtime_usec(&self) -> u64;

    /// Monotonic time in microseconds from an arbitrary origin.
    fn monotonic_usec(&self) -> u64;

    /// Wall-clock time in whole Unix seconds.
    fn now(&self) -> i64 {
        (self.realtime_usec() / USEC_PER_SEC) as i64
    }
}

/// The production clock: `chrono` for wall time, `Instant` for
/// monotonic time.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn realtime_usec(&self) -> u64 {
        chrono::Utc::now().timestamp_micros().max(0) as u64
    }

    fn monotonic_usec(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Detects that the host resumed from suspension.
///
/// Keeps the previous sample of both clocks. A resume is reported when
/// the realtime delta exceeds twice the monotonic delta, meaning wall
/// time advanced while the machine was not running. The samples are
/// updated on every call, so a resume is reported at most once.
#[derive(Debug, Default)]
pub struct SuspensionDetector {
    last_realtime: u64,
    last_monotonic: u64,
}

impl SuspensionDetector {
    /// A detector with no prior samples; the first call never reports a
    /// resume.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample both clocks and report whether the host appears to have
    /// just resumed from suspension.
    pub fn resumed_from_suspension(&mut self, clock: &dyn Clock) -> bool {
        let realtime = clock.realtime_usec();
        let monotonic = clock.monotonic_usec();

        let resumed = self.last_realtime != 0
            && self.last_monotonic != 0
            && realtime.saturating_sub(self.last_realtime)
                > 2 * monotonic.saturating_sub(self.last_monotonic);

        self.last_realtime = realtime;
        self.last_monotonic = monotonic;

        resumed
    }
}
