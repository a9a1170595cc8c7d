//! # earshot-core
//!
//! Passive-acoustic sensing engine: continuous microphone capture, magnitude
//! spectra, ambient-baseline calibration and spectral peak detection.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → acquisition thread
//!                                                     │
//!                                        Hamming window + FFT (one-sided)
//!                                                     │
//!                                   Calibrating? accumulate : subtract baseline
//!                                                     │
//!                               publish Snapshot + broadcast::Sender<ChunkEvent>
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens on the acquisition
//! thread; consumers poll [`EarshotEngine::latest_snapshot`] at their own
//! cadence and are never blocked by acquisition.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod spectrum;

// Convenience re-exports for downstream crates
pub use engine::{CaptureMode, EarshotEngine, EngineConfig, Snapshot};
pub use error::EarshotError;
pub use ipc::events::{ChunkEvent, EngineStatus, EngineStatusEvent};
pub use spectrum::baseline::{BaselineEstimator, BaselineSpectrum};
pub use spectrum::peaks::{find_peaks, DEFAULT_RELATIVE_THRESHOLD};
pub use spectrum::{SpectralTransform, SpectrumFrame};
