//! Frame pacer state machine.
//!
//! Tracks frame time, latency and the desired sleep time before the next
//! simulation tick. The pacer alternates between two phases keyed off the
//! frame id: "up" frames are scheduled slightly faster than the measured
//! steady state and "down" frames slightly slower. The intentional jitter
//! decorrelates the two measurements: latency is sampled while pacing is
//! relaxed (down), inverse throughput while pacing is tight (up).
//!
//! All time is in nanoseconds. The clock domain doesn't matter as long as it
//! is a single consistent clock. Access must be externally synchronized.

use crate::ewma::EwmaEstimator;

/// Maximum number of frames that can be in flight at once. Frame state is
/// kept in a ring keyed by `frame_id % MAX_INFLIGHT_FRAMES`.
pub const MAX_INFLIGHT_FRAMES: usize = 16;

/// Observed per-frame values are clamped to this range before being fed to
/// the estimators. Hard-coded heuristic: the pacer is not useful below
/// 20 FPS or above 1000 FPS.
const OBSERVATION_MIN_NS: i64 = 1_000_000;
const OBSERVATION_MAX_NS: i64 = 50_000_000;

/// Pacing multiplier for "up" (even) frames: scheduled 10% faster than the
/// measured inverse throughput.
const UP_FACTOR: f64 = 1.10;
/// Pacing divisor for "down" (odd) frames and for the projection itself:
/// 1.5% slower than the measured inverse throughput.
const DOWN_FACTOR: f64 = 0.985;

const UNSET: u64 = u64::MAX;

/// Tracks and computes frame time, latency and the desired wake-up time
/// before the next tick.
///
/// Usage per frame: [`get_wait_target`](Self::get_wait_target), sleep until
/// the target, [`begin_frame`](Self::begin_frame), and once the GPU finishes
/// the frame, [`end_frame`](Self::end_frame) from the completion thread.
pub struct FramePacer {
    frame_begin_ids: [u64; MAX_INFLIGHT_FRAMES],
    frame_begin_ts: [u64; MAX_INFLIGHT_FRAMES],
    /// Predicted end time of each in-flight frame, as an offset from
    /// `projection_base`.
    frame_end_projected_ts: [i64; MAX_INFLIGHT_FRAMES],
    /// Delay compensation that was applied when scheduling each frame.
    comp_applied: [i64; MAX_INFLIGHT_FRAMES],
    /// Anchor for `frame_end_projected_ts`, so projections stay small
    /// offsets rather than absolute timestamps. `UNSET` until the first
    /// wait-target computation after a frame has ended.
    projection_base: u64,
    prev_begin_id: u64,
    prev_end_id: u64,
    /// End timestamp of the previous frame after the FPS floor.
    prev_end_ts: u64,
    /// End timestamp of the previous frame before the FPS floor.
    prev_real_end_ts: u64,
    /// Prediction error of the most recently completed frame.
    prev_prediction_error: i64,
    latency: EwmaEstimator,
    inv_throughput: EwmaEstimator,
    proj_correction: EwmaEstimator,
    /// Minimum inter-frame interval in nanoseconds. 0 = unlimited.
    target_frame_time: u64,
}

impl FramePacer {
    pub fn new() -> Self {
        Self {
            frame_begin_ids: [UNSET; MAX_INFLIGHT_FRAMES],
            frame_begin_ts: [0; MAX_INFLIGHT_FRAMES],
            frame_end_projected_ts: [0; MAX_INFLIGHT_FRAMES],
            comp_applied: [0; MAX_INFLIGHT_FRAMES],
            projection_base: UNSET,
            prev_begin_id: UNSET,
            prev_end_id: UNSET,
            prev_end_ts: 0,
            prev_real_end_ts: 0,
            prev_prediction_error: 0,
            latency: EwmaEstimator::new(0.3),
            inv_throughput: EwmaEstimator::new(0.3),
            proj_correction: EwmaEstimator::new_full_weight(0.5),
            target_frame_time: 0,
        }
    }

    /// Compute the desired wake-up time for `frame_id`. Sleep until this
    /// time, then call [`begin_frame`](Self::begin_frame).
    ///
    /// Returns 0 if a wait target cannot be determined yet (no frame has
    /// ended since the last reset).
    pub fn get_wait_target(&mut self, frame_id: u64) -> u64 {
        if self.prev_end_id == UNSET {
            return 0;
        }

        let invtpt = self.inv_throughput.get();
        let latency = self.latency.get();

        if self.projection_base == UNSET {
            self.projection_base = self.prev_end_ts;
        } else {
            // Prediction error of the last completed frame. Only late
            // (queue-building) completions are compensated; early ones would
            // fight the pacing itself. The previously applied compensation
            // is subtracted inside the clamp so it isn't accounted twice.
            let projected = self.frame_end_projected_ts[slot(self.prev_end_id)];
            let err = self.prev_end_ts as i64 - (self.projection_base as i64 + projected);
            let prev_comp = self.comp_applied[slot(self.prev_end_id)];
            let prev_err = self.prev_prediction_error;
            self.proj_correction
                .update((err.max(0) - (prev_err - prev_comp).max(0)) as f64);
            self.prev_prediction_error = err;
        }

        let comp = self.proj_correction.get().round() as i64;
        self.comp_applied[slot(frame_id)] = comp;

        let frames_elapsed = frame_id.wrapping_sub(self.prev_begin_id) as i64 as f64;
        // Up frames front-load the next tick by scheduling 1/UP_FACTOR of a
        // frame instead of a full one; down frames use the plain interval.
        let first_frame_weight = if is_up_phase(frame_id) {
            1.0 / UP_FACTOR
        } else {
            1.0
        };

        let prev_projected = self.frame_end_projected_ts[slot(self.prev_begin_id)];
        let target = self.projection_base as i64
            + prev_projected
            + comp
            + ((frames_elapsed + first_frame_weight - 1.0) * invtpt / DOWN_FACTOR - latency)
                .round() as i64;

        // The projection is always paced at DOWN_FACTOR, without the
        // up-phase multiplier: a tighter wake-up grows the queue but does
        // not change the throughput, so predicting with it would bias the
        // projection early.
        self.frame_end_projected_ts[slot(frame_id)] =
            prev_projected + comp + (frames_elapsed * invtpt / DOWN_FACTOR).round() as i64;

        target.max(0) as u64
    }

    /// Commit the begin of `frame_id`.
    ///
    /// `target` is the wait target previously returned by
    /// [`get_wait_target`](Self::get_wait_target) (0 if none). `timestamp`
    /// is the effective begin time: the wake target if a sleep was
    /// performed, or the current time if the target was already in the past.
    pub fn begin_frame(&mut self, frame_id: u64, target: u64, timestamp: u64) {
        let s = slot(frame_id);
        self.frame_begin_ids[s] = frame_id;
        self.frame_begin_ts[s] = timestamp;
        self.prev_begin_id = frame_id;

        if target != 0 {
            // The OS may have woken us later (or, under the failsafe clamp,
            // earlier) than requested. Treat the difference as compensation
            // already applied so the next prediction error doesn't count it
            // again.
            let forced = timestamp as i64 - target as i64;
            self.frame_end_projected_ts[s] += forced;
            self.comp_applied[s] += forced;
            self.prev_prediction_error += forced;
        }
    }

    /// Commit the end of `frame_id` at `timestamp` (the CPU-observed GPU
    /// completion time) and update the estimators.
    ///
    /// Returns `(latency, frame_time)` where `latency` is the clamped
    /// begin-to-end time of this frame and `frame_time` is the raw delta
    /// from the previous frame's completion, before the FPS floor. Either is
    /// `None` when the measurement is unavailable; in particular the whole
    /// call is a no-op when the slot no longer belongs to `frame_id`
    /// (the counter was reset while this frame was in flight).
    pub fn end_frame(&mut self, frame_id: u64, timestamp: u64) -> (Option<u64>, Option<u64>) {
        let s = slot(frame_id);
        if self.frame_begin_ids[s] != frame_id {
            return (None, None);
        }
        self.frame_begin_ids[s] = UNSET;

        let has_prev = self.prev_end_id != UNSET;
        let frames_elapsed = if has_prev && frame_id > self.prev_end_id {
            frame_id - self.prev_end_id
        } else {
            0
        };

        // Raw inter-frame time for reporting, before the floor below.
        let frame_time = if frames_elapsed > 0 {
            Some(timestamp.saturating_sub(self.prev_real_end_ts))
        } else {
            None
        };
        let real_timestamp = timestamp;

        // FPS floor: pretend the frame ended no earlier than one target
        // interval after the previous one.
        let timestamp = if has_prev {
            timestamp.max(self.prev_end_ts + self.target_frame_time)
        } else {
            timestamp
        };

        let latency_val = (timestamp as i64 - self.frame_begin_ts[s] as i64)
            .clamp(OBSERVATION_MIN_NS, OBSERVATION_MAX_NS);
        if !is_up_phase(frame_id) {
            self.latency.update(latency_val as f64);
        }

        if frames_elapsed > 0 {
            let ft = ((timestamp as i64 - self.prev_end_ts as i64) / frames_elapsed as i64)
                .clamp(OBSERVATION_MIN_NS, OBSERVATION_MAX_NS);
            if is_up_phase(frame_id) {
                self.inv_throughput.update(ft as f64);
            }
        }

        self.prev_end_id = frame_id;
        self.prev_end_ts = timestamp;
        self.prev_real_end_ts = real_timestamp;

        (Some(latency_val as u64), frame_time)
    }

    /// Discard all pacing state, keeping only the configured target frame
    /// time. Equivalent to replacing the pacer with a fresh one.
    pub fn reset(&mut self) {
        let target_frame_time = self.target_frame_time;
        *self = Self::new();
        self.target_frame_time = target_frame_time;
    }

    /// Set the minimum inter-frame interval (the FPS floor). 0 disables it.
    /// Takes effect on the next frame.
    pub fn set_target_frame_time(&mut self, ns: u64) {
        self.target_frame_time = ns;
    }

    pub fn target_frame_time(&self) -> u64 {
        self.target_frame_time
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(frame_id: u64) -> usize {
    frame_id as usize % MAX_INFLIGHT_FRAMES
}

/// Phase 0 ("up") frames are paced faster than steady state and sample
/// inverse throughput; phase 1 ("down") frames are paced slower and sample
/// latency.
fn is_up_phase(frame_id: u64) -> bool {
    frame_id % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    /// Drive the pacer through `frames` frames that begin on a fixed cadence
    /// and complete `latency` after their begin. Frame ids start at
    /// `first_id`. Returns the wait targets the pacer produced.
    fn run_fixed_cadence(
        pacer: &mut FramePacer,
        first_id: u64,
        frames: u64,
        cadence: u64,
        latency: u64,
        start: u64,
    ) -> Vec<u64> {
        let mut targets = Vec::new();
        for i in 0..frames {
            let id = first_id + i;
            let begin = start + i * cadence;
            let target = pacer.get_wait_target(id);
            targets.push(target);
            pacer.begin_frame(id, target, begin);
            pacer.end_frame(id, begin + latency);
        }
        targets
    }

    #[test]
    fn test_cold_start_returns_zero() {
        let mut pacer = FramePacer::new();
        assert_eq!(pacer.get_wait_target(1), 0);
        pacer.begin_frame(1, 0, 1_000 * MS);
        // Still no completed frame.
        assert_eq!(pacer.get_wait_target(2), 0);
        pacer.end_frame(1, 1_020 * MS);
        assert_ne!(pacer.get_wait_target(2), 0);
    }

    #[test]
    fn test_slot_uniqueness() {
        let mut pacer = FramePacer::new();
        pacer.begin_frame(5, 0, 1_000 * MS);
        // A different id mapping to another slot must not disturb slot 5.
        let (latency, _) = pacer.end_frame(7, 2_000 * MS);
        assert_eq!(latency, None);
        let (latency, _) = pacer.end_frame(5, 1_020 * MS);
        assert_eq!(latency, Some(20 * MS));
    }

    #[test]
    fn test_end_frame_after_reset_is_noop() {
        let mut pacer = FramePacer::new();
        pacer.begin_frame(3, 0, 1_000 * MS);
        pacer.reset();
        let (latency, frame_time) = pacer.end_frame(3, 1_020 * MS);
        assert_eq!(latency, None);
        assert_eq!(frame_time, None);
    }

    #[test]
    fn test_latency_is_clamped() {
        let mut pacer = FramePacer::new();
        pacer.begin_frame(1, 0, 1_000 * MS);
        // 200 ms observed latency clamps to the 50 ms ceiling.
        let (latency, _) = pacer.end_frame(1, 1_200 * MS);
        assert_eq!(latency, Some(50 * MS));
    }

    #[test]
    fn test_steady_state_estimates_converge() {
        let mut pacer = FramePacer::new();
        let cadence = 16_666_667;
        run_fixed_cadence(&mut pacer, 1, 200, cadence, 20 * MS, 1_000 * MS);

        let latency_est = pacer.latency.get();
        let invtpt_est = pacer.inv_throughput.get();
        assert!(
            (latency_est - (20 * MS) as f64).abs() < MS as f64,
            "latency estimate {} not near 20 ms",
            latency_est
        );
        assert!(
            (invtpt_est - cadence as f64).abs() < 200_000.0,
            "inverse throughput estimate {} not near cadence",
            invtpt_est
        );

        // Feed one more frame and read the measurements back.
        let id = 201;
        let begin = 1_000 * MS + 200 * cadence;
        let target = pacer.get_wait_target(id);
        pacer.begin_frame(id, target, begin);
        let (latency, frame_time) = pacer.end_frame(id, begin + 20 * MS);
        assert_eq!(latency, Some(20 * MS));
        let ft = frame_time.unwrap();
        assert!(
            (ft as i64 - cadence as i64).abs() < MS as i64,
            "frame time {} not near cadence",
            ft
        );
    }

    #[test]
    fn test_steady_state_wake_cadence() {
        let mut pacer = FramePacer::new();
        let cadence = 16_666_667u64;
        let targets = run_fixed_cadence(&mut pacer, 1, 200, cadence, 20 * MS, 1_000 * MS);

        // After convergence, successive wake targets should be spaced by
        // roughly cadence / DOWN_FACTOR (~16.92 ms), averaged over a window
        // to smooth out the up/down alternation.
        let window = &targets[180..200];
        let avg_spacing =
            (window[window.len() - 1] - window[0]) as f64 / (window.len() - 1) as f64;
        let expected = cadence as f64 / DOWN_FACTOR;
        assert!(
            (avg_spacing - expected).abs() < 200_000.0,
            "average wake spacing {} not near {}",
            avg_spacing,
            expected
        );
    }

    /// Average spacing between consecutive wake targets over a window. The
    /// window must span whole up/down phase pairs for the intentional
    /// alternation to cancel out.
    fn avg_spacing(targets: &[u64]) -> f64 {
        (targets[targets.len() - 1] - targets[0]) as f64 / (targets.len() - 1) as f64
    }

    #[test]
    fn test_latency_spike_recovers() {
        let mut pacer = FramePacer::new();
        let cadence = 16_666_667u64;
        let pre = run_fixed_cadence(&mut pacer, 1, 100, cadence, 20 * MS, 1_000 * MS);
        let expected = cadence as f64 / DOWN_FACTOR;
        let pre_spacing = avg_spacing(&pre[94..99]);
        assert!((pre_spacing - expected).abs() < 300_000.0);

        // One frame completes 40 ms after its begin instead of 20 ms.
        let spike_id = 101;
        let spike_begin = 1_000 * MS + 100 * cadence;
        let pre_target = pacer.get_wait_target(spike_id);
        pacer.begin_frame(spike_id, pre_target, spike_begin);
        pacer.end_frame(spike_id, spike_begin + 40 * MS);

        // The next target must not be scheduled earlier than the spiked
        // frame's target: the extra queued work pushes pacing later, never
        // earlier.
        let mut targets = Vec::new();
        let end_base = spike_begin + 40 * MS;
        for i in 0..14u64 {
            let id = spike_id + 1 + i;
            let begin = end_base + (i + 1) * cadence;
            let target = pacer.get_wait_target(id);
            targets.push(target);
            pacer.begin_frame(id, target, begin);
            pacer.end_frame(id, begin + 20 * MS);
        }
        assert!(targets[0] >= pre_target);

        // The cadence settles back within the tail of the window.
        let post_spacing = avg_spacing(&targets[9..14]);
        assert!(
            (post_spacing - expected).abs() < 2.0 * MS as f64,
            "post-spike spacing {} not near {}",
            post_spacing,
            expected
        );
    }

    #[test]
    fn test_fps_floor_applies_to_throughput_samples() {
        let mut pacer = FramePacer::new();
        pacer.set_target_frame_time(10 * MS);

        // Natural end-to-end delta of 4 ms; the floor stretches every
        // reported interval to at least 10 ms.
        let mut prev_floored_end = 0u64;
        for i in 0..50u64 {
            let id = i + 1;
            let begin = 1_000 * MS + i * 4 * MS;
            let target = pacer.get_wait_target(id);
            pacer.begin_frame(id, target, begin);
            pacer.end_frame(id, begin + 2 * MS);
            if id > 1 {
                // The floored end timestamps advance by >= 10 ms, which is
                // what the throughput estimator sees.
                assert!(pacer.prev_end_ts >= prev_floored_end + 10 * MS);
            }
            prev_floored_end = pacer.prev_end_ts;
        }
        assert!(pacer.inv_throughput.get() >= (10 * MS) as f64);
    }

    #[test]
    fn test_reset_preserves_target_frame_time() {
        let mut pacer = FramePacer::new();
        pacer.set_target_frame_time(10 * MS);
        run_fixed_cadence(&mut pacer, 1, 10, 16 * MS, 20 * MS, 1_000 * MS);
        pacer.reset();
        assert_eq!(pacer.target_frame_time(), 10 * MS);
        assert_eq!(pacer.get_wait_target(1), 0);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut pacer = FramePacer::new();
        run_fixed_cadence(&mut pacer, 1, 10, 16 * MS, 20 * MS, 1_000 * MS);
        pacer.reset();
        pacer.reset();
        assert_eq!(pacer.get_wait_target(1), 0);
        assert_eq!(pacer.latency.get(), 0.0);
        assert_eq!(pacer.inv_throughput.get(), 0.0);
    }

    #[test]
    fn test_prev_end_id_monotone() {
        let mut pacer = FramePacer::new();
        pacer.begin_frame(1, 0, 1_000 * MS);
        pacer.begin_frame(2, 0, 1_016 * MS);
        pacer.end_frame(1, 1_020 * MS);
        assert_eq!(pacer.prev_end_id, 1);
        // An end for an already-freed or foreign slot does not move it.
        pacer.end_frame(1, 1_040 * MS);
        assert_eq!(pacer.prev_end_id, 1);
        pacer.end_frame(2, 1_036 * MS);
        assert_eq!(pacer.prev_end_id, 2);
    }

    #[test]
    fn test_oversleep_is_folded_into_compensation() {
        let mut pacer = FramePacer::new();
        let cadence = 16_666_667u64;
        run_fixed_cadence(&mut pacer, 1, 50, cadence, 20 * MS, 1_000 * MS);

        let id = 51;
        let target = pacer.get_wait_target(id);
        assert_ne!(target, 0);
        // Wake 3 ms late: the projection for this frame shifts by the same
        // amount so the next prediction error is unaffected.
        let projected_before = pacer.frame_end_projected_ts[slot(id)];
        pacer.begin_frame(id, target, target + 3 * MS);
        let projected_after = pacer.frame_end_projected_ts[slot(id)];
        assert_eq!(projected_after - projected_before, (3 * MS) as i64);
    }
}
