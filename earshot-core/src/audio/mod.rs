//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (beyond a reused mixdown scratch buffer)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing directly into an SPSC ring
//! buffer producer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` therefore must be created and dropped on the same
//! thread. The engine accomplishes this by calling `open` inside the
//! acquisition thread itself.

pub mod device;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, Stream,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
#[cfg(feature = "audio-cpal")]
use tracing::{info, warn};

#[cfg(feature = "audio-cpal")]
use crate::buffering::{Producer, SampleProducer};
use crate::error::{EarshotError, Result};

/// Shared flag raised by the cpal error callback and consumed by the
/// acquisition loop.
///
/// A raised flag is fatal to the current run: the loop surfaces it as
/// [`EarshotError::Stream`] and exits instead of retrying.
#[derive(Debug, Default)]
pub struct StreamErrorFlag {
    raised: AtomicBool,
    message: Mutex<Option<String>>,
}

impl StreamErrorFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stream failure. Only the first message is kept.
    pub fn raise(&self, message: String) {
        if !self.raised.swap(true, Ordering::AcqRel) {
            *self.message.lock() = Some(message);
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Take the failure message, if one was recorded.
    pub fn take_message(&self) -> Option<String> {
        if !self.is_raised() {
            return None;
        }
        self.message
            .lock()
            .take()
            .or_else(|| Some("audio stream failed".to_string()))
    }
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Sample rate the stream was opened at (Hz).
    pub sample_rate: u32,
    /// Name of the device the stream was opened on.
    pub device_name: String,
}

impl AudioCapture {
    /// Open an input device and push mono i16 samples into `producer`.
    ///
    /// With no `preferred_device`, the first input device passing the
    /// capability probe is used. With no `requested_rate`, the candidate rate
    /// list is tried in order (see [`device::CANDIDATE_RATES`]).
    ///
    /// Must be called from the thread that will also drop this value.
    ///
    /// # Errors
    /// - `EarshotError::DeviceUnavailable` — no device passed the probe, or a
    ///   named device was not found.
    /// - `EarshotError::NoValidConfiguration` — the device accepted no rate.
    /// - `EarshotError::Stream` — cpal failed to build or start the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        mut producer: SampleProducer,
        running: Arc<AtomicBool>,
        error_flag: Arc<StreamErrorFlag>,
        preferred_device: Option<&str>,
        requested_rate: Option<u32>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();

        let audio_device = if let Some(preferred_name) = preferred_device {
            let mut devices = host
                .input_devices()
                .map_err(|_| EarshotError::DeviceUnavailable)?;
            let found = devices.find(|d| {
                d.name()
                    .map(|name| name == preferred_name)
                    .unwrap_or(false)
            });
            match found {
                Some(d) if device::probe_input(&d).is_some() => d,
                _ => {
                    warn!("input device '{}' not found or not input-capable", preferred_name);
                    return Err(EarshotError::DeviceUnavailable);
                }
            }
        } else {
            host.input_devices()
                .map_err(|_| EarshotError::DeviceUnavailable)?
                .find(|d| device::probe_input(d).is_some())
                .ok_or(EarshotError::DeviceUnavailable)?
        };

        let device_name = audio_device
            .name()
            .unwrap_or_else(|_| "Unknown Input Device".to_string());

        let supported = device::resolve_input_config(&audio_device, &device_name, requested_rate)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let sample_format = supported.sample_format();
        let config = supported.config();

        info!(
            device = device_name.as_str(),
            sample_rate, channels, ?sample_format,
            "opening input device"
        );

        let err_flag = Arc::clone(&error_flag);
        let err_fn = move |err: cpal::StreamError| {
            tracing::error!("audio stream error: {err}");
            err_flag.raise(err.to_string());
        };

        // Pre-clone one Arc per sample format branch so each closure owns its flag.
        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);
        let running_u8 = Arc::clone(&running);

        let stream = match sample_format {
            SampleFormat::I16 => {
                let mut mix_buf: Vec<i16> = Vec::new();
                audio_device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        if channels == 1 {
                            push_all(&mut producer, data);
                            return;
                        }
                        let frames = data.len() / channels;
                        mix_buf.resize(frames, 0);
                        for (f, out) in mix_buf.iter_mut().enumerate() {
                            let base = f * channels;
                            let sum: i32 = data[base..base + channels]
                                .iter()
                                .map(|s| i32::from(*s))
                                .sum();
                            *out = (sum / channels as i32) as i16;
                        }
                        push_all(&mut producer, &mix_buf);
                    },
                    err_fn,
                    None,
                )
            }

            SampleFormat::F32 => {
                let mut mix_buf: Vec<i16> = Vec::new();
                audio_device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / channels;
                        mix_buf.resize(frames, 0);
                        for (f, out) in mix_buf.iter_mut().enumerate() {
                            let base = f * channels;
                            let sum: f32 = data[base..base + channels].iter().sum();
                            *out = f32_to_i16(sum / channels as f32);
                        }
                        push_all(&mut producer, &mix_buf);
                    },
                    err_fn,
                    None,
                )
            }

            SampleFormat::U8 => {
                let mut mix_buf: Vec<i16> = Vec::new();
                audio_device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running_u8.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / channels;
                        mix_buf.resize(frames, 0);
                        for (f, out) in mix_buf.iter_mut().enumerate() {
                            let base = f * channels;
                            let sum: i32 = data[base..base + channels]
                                .iter()
                                .map(|s| i32::from(*s) - 128)
                                .sum();
                            *out = ((sum / channels as i32) * 256) as i16;
                        }
                        push_all(&mut producer, &mix_buf);
                    },
                    err_fn,
                    None,
                )
            }

            fmt => {
                return Err(EarshotError::Stream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| EarshotError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| EarshotError::Stream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
            device_name,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: crate::buffering::SampleProducer,
        _running: Arc<AtomicBool>,
        _error_flag: Arc<StreamErrorFlag>,
        _preferred_device: Option<&str>,
        _requested_rate: Option<u32>,
    ) -> Result<Self> {
        Err(EarshotError::Stream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
fn push_all(producer: &mut SampleProducer, samples: &[i16]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!(
            "ring buffer full: dropped {} input frames",
            samples.len() - written
        );
    }
}

#[cfg(feature = "audio-cpal")]
fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32_767.0).clamp(-32_768.0, 32_767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_flag_keeps_first_message() {
        let flag = StreamErrorFlag::new();
        assert!(!flag.is_raised());
        assert!(flag.take_message().is_none());

        flag.raise("device unplugged".into());
        flag.raise("second failure".into());
        assert!(flag.is_raised());
        assert_eq!(flag.take_message().as_deref(), Some("device unplugged"));
    }

    #[test]
    fn error_flag_stays_raised_after_message_taken() {
        let flag = StreamErrorFlag::new();
        flag.raise("gone".into());
        let _ = flag.take_message();
        assert!(flag.is_raised());
        // Message already consumed; a generic one is substituted.
        assert_eq!(flag.take_message().as_deref(), Some("audio stream failed"));
    }

    #[cfg(feature = "audio-cpal")]
    #[test]
    fn f32_conversion_clamps_to_i16_range() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), 32_767);
        assert_eq!(f32_to_i16(-1.5), -32_768);
        assert_eq!(f32_to_i16(0.5), 16_383);
    }
}
