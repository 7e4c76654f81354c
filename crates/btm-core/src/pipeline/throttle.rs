//! Per-task progress throttling, rolling speed and time-remaining estimate.

use std::time::Instant;

/// Minimum interval between two progress emissions for one task.
const MIN_INTERVAL_MS: u128 = 500;

/// Minimum progress delta between two emissions.
const MIN_PROGRESS_DELTA: f64 = 0.02;

/// Mutable per-task emitter state.
#[derive(Debug)]
pub(super) struct ThrottleState {
    /// Expected transfer size in bytes; `-1` when unknown.
    pub(super) expected: i64,
    last_emit: Option<Instant>,
    last_progress: f64,
    last_bytes: u64,
    /// Rolling speed in MB/s, `< 0` until measurable.
    speed_mbps: f64,
}

impl Default for ThrottleState {
    fn default() -> Self {
        ThrottleState {
            expected: -1,
            last_emit: None,
            last_progress: -1.0,
            last_bytes: 0,
            speed_mbps: -1.0,
        }
    }
}

impl ThrottleState {
    /// Feed one byte-count sample. Returns `Some((progress, expected, speed,
    /// eta_ms))` when the sample should be emitted, `None` when throttled.
    ///
    /// The first sample is always emitted (it announces progress 0 alongside
    /// the `Running` status); afterwards a sample passes only when at least
    /// 500 ms elapsed since the last emission and progress moved >= 0.02.
    pub(super) fn sample(&mut self, now: Instant, bytes_total: u64) -> Option<(f64, i64, f64, i64)> {
        let progress = if self.expected > 0 {
            ((bytes_total as f64) / (self.expected as f64)).min(1.0)
        } else {
            0.0
        };

        match self.last_emit {
            None => {}
            Some(last) => {
                if now.duration_since(last).as_millis() < MIN_INTERVAL_MS {
                    return None;
                }
                if (progress - self.last_progress).abs() < MIN_PROGRESS_DELTA {
                    return None;
                }
                // Accepted sample: fold the interval speed into the rolling
                // average, (3*old + new) / 4.
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed > 0.0 && bytes_total > self.last_bytes {
                    let mbps = (bytes_total - self.last_bytes) as f64 / elapsed / 1e6;
                    self.speed_mbps = if self.speed_mbps < 0.0 {
                        mbps
                    } else {
                        (3.0 * self.speed_mbps + mbps) / 4.0
                    };
                }
            }
        }

        self.last_emit = Some(now);
        self.last_progress = progress;
        self.last_bytes = bytes_total;

        let eta_ms = if self.speed_mbps > 0.0 && self.expected > 0 {
            let remaining = (self.expected as u64).saturating_sub(bytes_total) as f64;
            (remaining / (self.speed_mbps * 1e6) * 1000.0) as i64
        } else {
            -1
        };
        Some((progress, self.expected, self.speed_mbps, eta_ms))
    }
}
