//! Ambient-baseline estimation.
//!
//! While calibration is active every spectrum frame is added into an f64
//! running sum; ending calibration divides by the frame count to produce the
//! mean ambient spectrum. Double precision keeps the sum exact enough across
//! thousands of frames during a long calibration window.

use tracing::warn;

/// Mean ambient spectrum learned during a calibration window.
#[derive(Debug, Clone)]
pub struct BaselineSpectrum {
    /// Element-wise mean magnitudes, same length as the frames it was built from.
    pub values: Vec<f64>,
    /// How many frames contributed to the mean.
    pub frames: usize,
}

/// Running element-wise sum of spectrum frames plus a frame count.
///
/// The accumulator exists only while calibration is active; `finish_calibration`
/// consumes it, `reset` discards it.
#[derive(Debug, Default)]
pub struct BaselineEstimator {
    sum: Option<Vec<f64>>,
    count: usize,
}

impl BaselineEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the accumulator and count for a fresh calibration window.
    pub fn start_calibration(&mut self) {
        self.sum = None;
        self.count = 0;
    }

    /// Add one frame into the running sum.
    pub fn accumulate(&mut self, magnitudes: &[f64]) {
        match &mut self.sum {
            Some(acc) if acc.len() == magnitudes.len() => {
                for (a, m) in acc.iter_mut().zip(magnitudes) {
                    *a += m;
                }
                self.count += 1;
            }
            Some(acc) => {
                // Frame shape changed mid-calibration; restart from this frame.
                warn!(
                    have = acc.len(),
                    got = magnitudes.len(),
                    "frame length changed during calibration — restarting accumulation"
                );
                self.sum = Some(magnitudes.to_vec());
                self.count = 1;
            }
            None => {
                self.sum = Some(magnitudes.to_vec());
                self.count = 1;
            }
        }
    }

    /// Frames accumulated so far (for progress display).
    pub fn sample_count(&self) -> usize {
        self.count
    }

    /// Finalise the mean baseline, or `None` when nothing was accumulated.
    ///
    /// Consumes the accumulator; the count is kept for display until the next
    /// `start_calibration` or `reset`.
    pub fn finish_calibration(&mut self) -> Option<BaselineSpectrum> {
        let sum = self.sum.take()?;
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(BaselineSpectrum {
            values: sum.into_iter().map(|v| v / n).collect(),
            frames: self.count,
        })
    }

    /// Discard accumulator and count entirely.
    pub fn reset(&mut self) {
        self.sum = None;
        self.count = 0;
    }
}
