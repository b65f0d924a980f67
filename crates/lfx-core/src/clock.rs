//! Monotonic nanosecond clock shared by all pacer timestamps.
//!
//! The pacer only cares that begin and end timestamps come from one
//! consistent clock domain. On Linux we read `CLOCK_BOOTTIME`, which keeps
//! counting across suspend and lines up with system-wide trace timestamps.
//! Elsewhere we fall back to a process-epoch `Instant`.

/// Current time in nanoseconds on the shared monotonic clock.
#[cfg(target_os = "linux")]
pub fn current_time_ns() -> u64 {
    use rustix::time::{clock_gettime, ClockId};

    let ts = clock_gettime(ClockId::Boottime);
    timespec_to_ns(ts.tv_sec, ts.tv_nsec)
}

/// Current time in nanoseconds on the shared monotonic clock.
#[cfg(not(target_os = "linux"))]
pub fn current_time_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

#[cfg(target_os = "linux")]
fn timespec_to_ns(sec: i64, nsec: i64) -> u64 {
    let sec = u64::try_from(sec).unwrap_or(0);
    let nsec = u64::try_from(nsec).unwrap_or(0).min(999_999_999);
    sec.saturating_mul(1_000_000_000).saturating_add(nsec)
}
