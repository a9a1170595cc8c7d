//! Spectral peak detection.

/// Fraction of the running reference maximum a bin must reach to count as a peak.
pub const DEFAULT_RELATIVE_THRESHOLD: f64 = 0.1;

/// Indices of local maxima in `magnitudes` at or above
/// `relative_threshold * reference_max`.
///
/// `reference_max` is the session's running maximum magnitude, not the max of
/// this frame — thresholding against a slowly rising overall scale rather than
/// per-frame noise. Boundary bins are never peaks. Indices are ascending.
///
/// Returns an empty set when `reference_max <= 0`: no scale has been
/// established yet, so every bin (including negative baseline-corrected ones)
/// is treated as sub-threshold.
pub fn find_peaks(magnitudes: &[f64], relative_threshold: f64, reference_max: f64) -> Vec<usize> {
    if reference_max <= 0.0 || magnitudes.len() < 3 {
        return Vec::new();
    }
    let height = relative_threshold * reference_max;

    let mut peaks = Vec::new();
    for i in 1..magnitudes.len() - 1 {
        let m = magnitudes[i];
        if m >= magnitudes[i - 1] && m >= magnitudes[i + 1] && m >= height {
            peaks.push(i);
        }
    }
    peaks
}
