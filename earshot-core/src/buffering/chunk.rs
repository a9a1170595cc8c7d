//! Typed audio chunk passed from the ring buffer to the spectral stage.

/// A contiguous block of mono signed 16-bit samples at a known sample rate.
///
/// Immutable once captured; allocated once per acquisition cycle (on the
/// non-RT acquisition thread).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono PCM samples as delivered by the device.
    pub samples: Vec<i16>,
    /// Sample rate in Hz (e.g. 44100, 48000, 4000).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Samples per chunk for a given rate and update cadence.
    ///
    /// Truncating integer division, clamped to at least one sample.
    pub fn size_for(sample_rate: u32, updates_per_second: u32) -> usize {
        ((sample_rate / updates_per_second.max(1)) as usize).max(1)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Time offset of each sample relative to the chunk start, in seconds.
    pub fn time_axis(&self) -> Vec<f64> {
        let rate = self.sample_rate as f64;
        (0..self.samples.len()).map(|i| i as f64 / rate).collect()
    }

    /// Largest absolute sample value, as f64 (safe for `i16::MIN`).
    pub fn peak_amplitude(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| f64::from(s.unsigned_abs()))
            .fold(0.0, f64::max)
    }
}
