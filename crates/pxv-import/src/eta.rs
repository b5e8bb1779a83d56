//! Time-remaining estimate for a running task.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SMOOTHING: f64 = 0.3;
const UPDATE_INTERVAL: Duration = Duration::from_secs(2);
const WINDOW: Duration = Duration::from_secs(30);
/// Closer samples are folded into the estimate but not retained.
const SAMPLE_SPACING: Duration = Duration::from_millis(250);
const MAX_SAMPLES: usize = 128;
/// Below this much progress the rate is too noisy to extrapolate.
const MIN_PROGRESS: f64 = 0.05;

/// Exponentially smoothed ETA over a sliding window of progress samples.
#[derive(Debug, Default)]
pub struct EtaEstimator {
    samples: VecDeque<(Instant, f64)>,
    estimate: Option<f64>,
    last_update: Option<Instant>,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `progress` (0.0..=1.0) observed at `now` and return the current
    /// estimate in seconds.
    pub fn observe(&mut self, now: Instant, progress: f64) -> Option<f64> {
        let spaced = match self.samples.back() {
            Some((t, _)) => now.saturating_duration_since(*t) >= SAMPLE_SPACING,
            None => true,
        };
        if spaced {
            self.samples.push_back((now, progress));
            if self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some((t, _)) if now.duration_since(*t) > WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        if progress <= MIN_PROGRESS {
            return None;
        }
        if let Some(last) = self.last_update {
            if now.duration_since(last) < UPDATE_INTERVAL {
                return self.estimate;
            }
        }

        let (t0, p0) = *self.samples.front()?;
        let elapsed = now.duration_since(t0).as_secs_f64();
        let advanced = progress - p0;
        if elapsed <= 0.0 || advanced <= 0.0 {
            return self.estimate;
        }

        let remaining = (1.0 - progress).max(0.0) / (advanced / elapsed);
        let smoothed = match self.estimate {
            Some(prev) => SMOOTHING * remaining + (1.0 - SMOOTHING) * prev,
            None => remaining,
        };
        self.estimate = Some(smoothed);
        self.last_update = Some(now);
        self.estimate
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
