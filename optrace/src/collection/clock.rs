//! Clocks and thread identity used on the collection hot path.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Nanosecond time, relative to the Unix epoch once converted.
pub type TimeNs = i64;

/// End time of an operation that never received its end stamp.
pub const UNTERMINATED: TimeNs = TimeNs::MIN;

/// Raw reading of the approximate clock. Only meaningful once converted with
/// a [`ClockConverter`] captured during the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct ApproxTime(pub i64);

impl ApproxTime {
    /// Sentinel stored in records whose end was never stamped.
    pub const UNSET: ApproxTime = ApproxTime(i64::MIN);

    pub const fn is_unset(self) -> bool {
        self.0 == i64::MIN
    }
}

/// Read the approximate clock via `CLOCK_MONOTONIC` (a vDSO call on Linux).
pub fn approx_now() -> ApproxTime {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, initialized timespec on the stack and
    // CLOCK_MONOTONIC is always available.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ApproxTime(ts.tv_sec * 1_000_000_000 + ts.tv_nsec)
}

/// Get the OS thread ID (tid) of the calling thread via `gettid()`.
pub fn current_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Maps approximate clock readings onto wall-clock nanoseconds.
///
/// Captures one `(approx, wall)` pair at construction; conversion is a single
/// offset. [`ApproxTime::UNSET`] always converts to [`UNTERMINATED`].
#[derive(Debug, Clone, Copy)]
pub struct ClockConverter {
    approx_origin: i64,
    wall_origin_ns: i64,
}

impl Default for ClockConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockConverter {
    pub fn new() -> Self {
        let approx_origin = approx_now().0;
        let wall_origin_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            approx_origin,
            wall_origin_ns,
        }
    }

    /// Converter with explicit origins.
    pub const fn with_origin(approx_origin: i64, wall_origin_ns: i64) -> Self {
        Self {
            approx_origin,
            wall_origin_ns,
        }
    }

    pub fn convert(&self, t: ApproxTime) -> TimeNs {
        if t.is_unset() {
            return UNTERMINATED;
        }
        t.0 - self.approx_origin + self.wall_origin_ns
    }
}

/// Wrap a caller supplied converter so the unset sentinel survives conversion.
pub(crate) fn preserve_unset(converter: impl Fn(ApproxTime) -> TimeNs) -> impl Fn(ApproxTime) -> TimeNs {
    move |t| if t.is_unset() { UNTERMINATED } else { converter(t) }
}
