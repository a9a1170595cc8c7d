//! Spectral transform: Hamming window + one-sided magnitude spectrum.
//!
//! `transform` is a pure function of its inputs; the struct only caches the
//! FFT plan, window and frequency axis for the current (chunk size, rate)
//! pair so repeated chunks of identical shape cost no re-planning.

pub mod baseline;
pub mod peaks;

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::buffering::chunk::AudioChunk;

/// One-sided magnitude spectrum of a single chunk.
///
/// `magnitudes` holds the first N/2 DFT moduli (non-negative frequencies of a
/// real-valued input); `freqs` is the parallel axis of bin centers in Hz,
/// shared between all frames of identical shape.
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    pub magnitudes: Vec<f64>,
    pub freqs: Arc<Vec<f64>>,
}

impl SpectrumFrame {
    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }
}

/// Windowed FFT with cached plan and frequency axis.
pub struct SpectralTransform {
    planner: FftPlanner<f64>,
    fft: Option<Arc<dyn Fft<f64>>>,
    window: Vec<f64>,
    freqs: Arc<Vec<f64>>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    chunk_size: usize,
    sample_rate: u32,
}

impl SpectralTransform {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            fft: None,
            window: Vec::new(),
            freqs: Arc::new(Vec::new()),
            buffer: Vec::new(),
            scratch: Vec::new(),
            chunk_size: 0,
            sample_rate: 0,
        }
    }

    /// Window `chunk`, run the forward DFT and return the one-sided
    /// magnitude spectrum with its frequency axis.
    pub fn transform(&mut self, chunk: &AudioChunk) -> SpectrumFrame {
        let n = chunk.samples.len();
        if n == 0 {
            return SpectrumFrame {
                magnitudes: Vec::new(),
                freqs: Arc::new(Vec::new()),
            };
        }

        if n != self.chunk_size || chunk.sample_rate != self.sample_rate {
            self.reconfigure(n, chunk.sample_rate);
        }

        self.buffer.clear();
        self.buffer.extend(
            chunk
                .samples
                .iter()
                .zip(&self.window)
                .map(|(s, w)| Complex::new(f64::from(*s) * w, 0.0)),
        );

        // `reconfigure` always plans an FFT for nonzero n.
        if let Some(fft) = &self.fft {
            fft.process_with_scratch(&mut self.buffer, &mut self.scratch);
        }

        let magnitudes = self.buffer[..n / 2].iter().map(|c| c.norm()).collect();

        SpectrumFrame {
            magnitudes,
            freqs: Arc::clone(&self.freqs),
        }
    }

    /// Frequency axis for the most recent (chunk size, rate) pair.
    pub fn frequency_axis(&self) -> Arc<Vec<f64>> {
        Arc::clone(&self.freqs)
    }

    fn reconfigure(&mut self, chunk_size: usize, sample_rate: u32) {
        let fft = self.planner.plan_fft_forward(chunk_size);
        self.scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        self.window = hamming(chunk_size);

        let rate = sample_rate as f64;
        let n = chunk_size as f64;
        self.freqs = Arc::new(
            (0..chunk_size / 2)
                .map(|i| i as f64 * rate / n)
                .collect(),
        );

        self.fft = Some(fft);
        self.chunk_size = chunk_size;
        self.sample_rate = sample_rate;
    }
}

impl Default for SpectralTransform {
    fn default() -> Self {
        Self::new()
    }
}

/// Hamming window of length `n`: 0.54 - 0.46·cos(2πi / (n-1)).
fn hamming(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos())
        .collect()
}
