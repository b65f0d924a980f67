//! Gates the pre-frame sleep on rendering actually being in flight.
//!
//! When the GPU is idle (first frame, paused game, menu without redraws)
//! sleeping before the next tick adds latency without reducing any queue.
//! The tracker watches which frame last began and which last finished; when
//! the two meet, nothing is in flight and a pending sleep is cut short.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

const UNSET: u64 = u64::MAX;

struct State {
    last_begun: u64,
    last_finished: u64,
}

/// Tracks in-flight frames and turns unnecessary sleeps into no-ops.
pub struct IdleTracker {
    state: Mutex<State>,
    cond: Condvar,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                last_begun: UNSET,
                last_finished: UNSET,
            }),
            cond: Condvar::new(),
        }
    }

    /// Sleep for up to `duration`, waking early if no frame is in flight,
    /// then record `frame_id` as begun.
    ///
    /// Returns `true` if the sleep ran its full course, or `false` if it was
    /// cut short (or skipped) because nothing was in flight. On an early
    /// return the caller should treat "now" as the effective begin time
    /// rather than the planned wake target.
    pub fn sleep_and_begin(&self, frame_id: u64, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while state.last_begun != state.last_finished {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let idle = state.last_begun == state.last_finished;
        state.last_begun = frame_id;
        !idle
    }

    /// Record `frame_id` as finished, waking a sleeper when it was the last
    /// frame in flight.
    pub fn end(&self, frame_id: u64) {
        let mut state = self.state.lock();
        state.last_finished = frame_id;
        if state.last_begun == state.last_finished {
            self.cond.notify_all();
        }
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_initially_idle_skips_sleep() {
        let tracker = IdleTracker::new();
        let start = Instant::now();
        let slept = tracker.sleep_and_begin(1, Duration::from_millis(100));
        assert!(!slept);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_finished_frame_makes_tracker_idle() {
        let tracker = IdleTracker::new();
        tracker.sleep_and_begin(1, Duration::ZERO);
        tracker.end(1);

        let start = Instant::now();
        let slept = tracker.sleep_and_begin(2, Duration::from_millis(100));
        assert!(!slept);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_inflight_frame_sleeps_full_duration() {
        let tracker = IdleTracker::new();
        tracker.sleep_and_begin(1, Duration::ZERO);
        // Frame 1 never ends: the next sleep must run its full course.
        let start = Instant::now();
        let slept = tracker.sleep_and_begin(2, Duration::from_millis(30));
        assert!(slept);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_completion_wakes_sleeper_early() {
        let tracker = Arc::new(IdleTracker::new());
        tracker.sleep_and_begin(1, Duration::ZERO);

        let t = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                tracker.end(1);
            })
        };

        let start = Instant::now();
        let slept = tracker.sleep_and_begin(2, Duration::from_millis(500));
        t.join().unwrap();
        assert!(!slept);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_zero_duration_with_inflight_frame() {
        let tracker = IdleTracker::new();
        tracker.sleep_and_begin(1, Duration::ZERO);
        let slept = tracker.sleep_and_begin(2, Duration::ZERO);
        assert!(slept);
    }
}
