//! Blocking acquisition loop.
//!
//! ## Cycle (per iteration)
//!
//! ```text
//! 1. Assemble exactly one chunk from the ring buffer (blocking)
//! 2. Hamming window + FFT → one-sided magnitude frame
//! 3. Branch on capture mode (under the calibration lock):
//!    Calibrating       → accumulate raw frame, publish raw frame
//!    Normal + baseline → publish frame − baseline (may go negative)
//!    Normal, none      → publish frame unmodified
//! 4. Update running maxima and swap in the new snapshot (one lock)
//! 5. Broadcast one ChunkEvent with the calibration sample count
//! ```
//!
//! The loop blocks only while waiting for samples; transform and publish are
//! cheap relative to the chunk duration, so cadence is governed by real-time
//! audio arrival. A raised stream-error flag or a cleared running flag ends
//! the loop within one poll interval.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    audio::StreamErrorFlag,
    buffering::{chunk::AudioChunk, Consumer, SampleConsumer},
    engine::{CalibrationState, CaptureMode, LatestFrame, PublishedState},
    ipc::events::{ChunkEvent, EngineStatus, EngineStatusEvent},
    spectrum::{SpectralTransform, SpectrumFrame},
};

/// Shared counters for observability; reset at each `start()`.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub chunks_published: AtomicUsize,
    pub frames_accumulated: AtomicUsize,
    pub frames_corrected: AtomicUsize,
    pub frames_raw: AtomicUsize,
    pub stream_errors: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.chunks_published.store(0, Ordering::Relaxed);
        self.frames_accumulated.store(0, Ordering::Relaxed);
        self.frames_corrected.store(0, Ordering::Relaxed);
        self.frames_raw.store(0, Ordering::Relaxed);
        self.stream_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_published: self.chunks_published.load(Ordering::Relaxed),
            frames_accumulated: self.frames_accumulated.load(Ordering::Relaxed),
            frames_corrected: self.frames_corrected.load(Ordering::Relaxed),
            frames_raw: self.frames_raw.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub chunks_published: usize,
    pub frames_accumulated: usize,
    pub frames_corrected: usize,
    pub frames_raw: usize,
    pub stream_errors: usize,
}

/// All context the acquisition loop needs, passed as one struct so the
/// spawning closure stays tidy.
pub struct PipelineContext {
    pub chunk_size: usize,
    pub sample_rate: u32,
    pub consumer: SampleConsumer,
    pub running: Arc<AtomicBool>,
    pub stream_error: Arc<StreamErrorFlag>,
    pub calibration: Arc<Mutex<CalibrationState>>,
    pub published: Arc<Mutex<PublishedState>>,
    pub chunks_read: Arc<AtomicU64>,
    pub chunk_tx: broadcast::Sender<ChunkEvent>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Sleep between ring polls while a chunk is incomplete.
/// Bounds how stale a stop request or stream error can go unnoticed.
const READ_POLL_SLEEP: Duration = Duration::from_millis(2);

enum ReadOutcome {
    Chunk,
    Stopped,
    Failed(String),
}

/// Run the blocking acquisition loop until `ctx.running` becomes false or the
/// stream fails.
pub fn run(mut ctx: PipelineContext) {
    info!(
        chunk_size = ctx.chunk_size,
        sample_rate = ctx.sample_rate,
        "acquisition loop started"
    );

    let mut transform = SpectralTransform::new();
    // Time axis is fixed for the whole run; shared with every snapshot.
    let time_axis: Arc<Vec<f64>> = Arc::new(
        (0..ctx.chunk_size)
            .map(|i| i as f64 / ctx.sample_rate as f64)
            .collect(),
    );
    let mut scratch = vec![0i16; ctx.chunk_size];

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        match read_exact(
            &mut ctx.consumer,
            &ctx.running,
            &ctx.stream_error,
            &mut scratch,
        ) {
            ReadOutcome::Chunk => {}
            ReadOutcome::Stopped => break,
            ReadOutcome::Failed(message) => {
                ctx.diagnostics.stream_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %message, "audio stream failed — terminating acquisition");
                *ctx.status.lock() = EngineStatus::Error;
                let _ = ctx.status_tx.send(EngineStatusEvent {
                    status: EngineStatus::Error,
                    detail: Some(message),
                });
                ctx.running.store(false, Ordering::SeqCst);
                break;
            }
        }

        let chunk = AudioChunk::new(scratch.clone(), ctx.sample_rate);
        let SpectrumFrame { magnitudes, freqs } = transform.transform(&chunk);

        // Branch under the calibration lock so a mode toggle can never land
        // between the check and the accumulate/subtract it selects.
        let (published_magnitudes, calibration_samples, calibrating) = {
            let mut cal = ctx.calibration.lock();
            match cal.mode {
                CaptureMode::Calibrating => {
                    cal.estimator.accumulate(&magnitudes);
                    ctx.diagnostics
                        .frames_accumulated
                        .fetch_add(1, Ordering::Relaxed);
                    // Raw frame still goes out so a display can show live input.
                    (magnitudes, cal.estimator.sample_count(), true)
                }
                CaptureMode::Normal => {
                    let samples = cal.estimator.sample_count();
                    match &cal.baseline {
                        Some(baseline) if baseline.values.len() == magnitudes.len() => {
                            ctx.diagnostics
                                .frames_corrected
                                .fetch_add(1, Ordering::Relaxed);
                            let corrected = magnitudes
                                .iter()
                                .zip(&baseline.values)
                                .map(|(m, b)| m - b)
                                .collect();
                            (corrected, samples, false)
                        }
                        _ => {
                            ctx.diagnostics.frames_raw.fetch_add(1, Ordering::Relaxed);
                            (magnitudes, samples, false)
                        }
                    }
                }
            }
        };

        let chunk_peak = chunk.peak_amplitude();
        let frame_peak = published_magnitudes
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        // Maxima, counter and snapshot move together under one lock so no
        // reader ever sees a chunk paired with another cycle's frame.
        let counter = {
            let mut published = ctx.published.lock();
            if chunk_peak > published.max_amplitude {
                published.max_amplitude = chunk_peak;
            }
            if frame_peak > published.max_magnitude {
                published.max_magnitude = frame_peak;
            }
            let counter = ctx.chunks_read.fetch_add(1, Ordering::Relaxed) + 1;
            published.latest = Some(LatestFrame {
                counter,
                samples: Arc::new(chunk.samples),
                time_axis: Arc::clone(&time_axis),
                magnitudes: Arc::new(published_magnitudes),
                freq_axis: freqs,
            });
            counter
        };

        ctx.diagnostics
            .chunks_published
            .fetch_add(1, Ordering::Relaxed);
        let _ = ctx.chunk_tx.send(ChunkEvent {
            counter,
            calibration_samples,
            calibrating,
        });
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        chunks_published = snap.chunks_published,
        frames_accumulated = snap.frames_accumulated,
        frames_corrected = snap.frames_corrected,
        frames_raw = snap.frames_raw,
        stream_errors = snap.stream_errors,
        "acquisition loop stopped — diagnostics"
    );
}

/// Block until `out` is completely filled from the ring buffer.
///
/// Checks the stop flag and the stream-error flag between polls, so neither
/// waits longer than one poll interval to take effect.
fn read_exact(
    consumer: &mut SampleConsumer,
    running: &AtomicBool,
    stream_error: &StreamErrorFlag,
    out: &mut [i16],
) -> ReadOutcome {
    let mut filled = 0;
    while filled < out.len() {
        if let Some(message) = stream_error.take_message() {
            return ReadOutcome::Failed(message);
        }
        if !running.load(Ordering::Relaxed) {
            return ReadOutcome::Stopped;
        }
        let n = consumer.pop_slice(&mut out[filled..]);
        if n == 0 {
            std::thread::sleep(READ_POLL_SLEEP);
        } else {
            filled += n;
        }
    }
    ReadOutcome::Chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::{Duration, Instant};

    use approx::assert_relative_eq;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::buffering::{create_sample_ring, Producer, SampleProducer};
    use crate::spectrum::baseline::BaselineSpectrum;

    struct Harness {
        producer: SampleProducer,
        running: Arc<AtomicBool>,
        stream_error: Arc<StreamErrorFlag>,
        calibration: Arc<Mutex<CalibrationState>>,
        published: Arc<Mutex<PublishedState>>,
        status: Arc<Mutex<EngineStatus>>,
        chunk_rx: broadcast::Receiver<ChunkEvent>,
        status_rx: broadcast::Receiver<EngineStatusEvent>,
        handle: thread::JoinHandle<()>,
    }

    impl Harness {
        fn spawn(chunk_size: usize, sample_rate: u32, calibrating: bool) -> Self {
            let (producer, consumer) = create_sample_ring();
            let running = Arc::new(AtomicBool::new(true));
            let stream_error = Arc::new(StreamErrorFlag::new());
            let mut initial = CalibrationState::default();
            if calibrating {
                initial.mode = CaptureMode::Calibrating;
                initial.estimator.start_calibration();
            }
            let calibration = Arc::new(Mutex::new(initial));
            let published = Arc::new(Mutex::new(PublishedState::default()));
            let status = Arc::new(Mutex::new(EngineStatus::Listening));
            let (chunk_tx, chunk_rx) = broadcast::channel(32);
            let (status_tx, status_rx) = broadcast::channel(8);

            let ctx = PipelineContext {
                chunk_size,
                sample_rate,
                consumer,
                running: Arc::clone(&running),
                stream_error: Arc::clone(&stream_error),
                calibration: Arc::clone(&calibration),
                published: Arc::clone(&published),
                chunks_read: Arc::new(AtomicU64::new(0)),
                chunk_tx,
                status_tx,
                status: Arc::clone(&status),
                diagnostics: Arc::new(PipelineDiagnostics::default()),
            };

            let handle = thread::spawn(move || run(ctx));

            Self {
                producer,
                running,
                stream_error,
                calibration,
                published,
                status,
                chunk_rx,
                status_rx,
                handle,
            }
        }

        fn shutdown(self) {
            self.running.store(false, Ordering::SeqCst);
            self.handle.join().expect("acquisition thread panicked");
        }
    }

    fn recv_chunk_with_timeout(
        rx: &mut broadcast::Receiver<ChunkEvent>,
        timeout: Duration,
    ) -> ChunkEvent {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for chunk event");
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("chunk channel closed unexpectedly"),
            }
        }
    }

    fn expected_magnitudes(samples: &[i16], rate: u32) -> Vec<f64> {
        let mut transform = SpectralTransform::new();
        transform
            .transform(&AudioChunk::new(samples.to_vec(), rate))
            .magnitudes
    }

    #[test]
    fn publishes_chunks_with_gapless_counters() {
        let mut harness = Harness::spawn(64, 640, false);
        harness.producer.push_slice(&vec![100i16; 192]);

        let mut counters = Vec::new();
        for _ in 0..3 {
            let ev = recv_chunk_with_timeout(&mut harness.chunk_rx, Duration::from_secs(1));
            counters.push(ev.counter);
            assert!(!ev.calibrating);
        }
        assert_eq!(counters, vec![1, 2, 3]);

        {
            let published = harness.published.lock();
            let latest = published.latest.as_ref().expect("snapshot published");
            assert_eq!(latest.counter, 3);
            assert_eq!(latest.samples.len(), 64);
            assert_eq!(latest.magnitudes.len(), 32);
            assert_eq!(latest.freq_axis.len(), 32);
            assert_eq!(latest.time_axis.len(), 64);
            assert_eq!(published.max_amplitude, 100.0);
        }

        harness.shutdown();
    }

    #[test]
    fn calibrating_accumulates_and_still_publishes_raw_frames() {
        let mut harness = Harness::spawn(64, 640, true);
        let chunk: Vec<i16> = vec![1_000; 64];
        harness.producer.push_slice(&chunk);
        harness.producer.push_slice(&chunk);
        harness.producer.push_slice(&chunk);

        for expected_count in 1..=3usize {
            let ev = recv_chunk_with_timeout(&mut harness.chunk_rx, Duration::from_secs(1));
            assert!(ev.calibrating);
            assert_eq!(ev.calibration_samples, expected_count);
        }

        {
            let cal = harness.calibration.lock();
            assert_eq!(cal.estimator.sample_count(), 3);
            assert!(cal.baseline.is_none());
        }

        let expected = expected_magnitudes(&chunk, 640);
        {
            let published = harness.published.lock();
            let latest = published.latest.as_ref().expect("snapshot published");
            for (got, want) in latest.magnitudes.iter().zip(&expected) {
                assert_relative_eq!(*got, *want, max_relative = 1e-9);
            }
        }

        harness.shutdown();
    }

    #[test]
    fn normal_mode_subtracts_stored_baseline_without_clamping() {
        let mut harness = Harness::spawn(64, 640, false);
        harness.calibration.lock().baseline = Some(Arc::new(BaselineSpectrum {
            values: vec![2.5; 32],
            frames: 5,
        }));

        // Silence transforms to all-zero magnitudes, so the published frame
        // must be exactly -2.5 in every bin.
        harness.producer.push_slice(&vec![0i16; 64]);
        let ev = recv_chunk_with_timeout(&mut harness.chunk_rx, Duration::from_secs(1));
        assert!(!ev.calibrating);

        {
            let published = harness.published.lock();
            let latest = published.latest.as_ref().expect("snapshot published");
            assert!(latest.magnitudes.iter().all(|m| *m == -2.5));
            // An all-negative frame never raises the running magnitude max.
            assert_eq!(published.max_magnitude, 0.0);
        }

        harness.shutdown();
    }

    #[test]
    fn stream_failure_terminates_loop_and_reports_error() {
        let mut harness = Harness::spawn(64, 640, false);
        harness.stream_error.raise("device disconnected".into());

        harness.handle.join().expect("acquisition thread panicked");
        assert!(!harness.running.load(Ordering::SeqCst));
        assert_eq!(*harness.status.lock(), EngineStatus::Error);

        let start = Instant::now();
        let event = loop {
            match harness.status_rx.try_recv() {
                Ok(ev) => break ev,
                Err(TryRecvError::Empty) if start.elapsed() < Duration::from_secs(1) => {
                    thread::sleep(Duration::from_millis(2));
                }
                other => panic!("no status event: {other:?}"),
            }
        };
        assert_eq!(event.status, EngineStatus::Error);
        assert_eq!(event.detail.as_deref(), Some("device disconnected"));
    }

    #[test]
    fn stop_request_is_observed_while_waiting_for_samples() {
        let harness = Harness::spawn(64, 640, false);
        thread::sleep(Duration::from_millis(20));
        let published = Arc::clone(&harness.published);
        harness.shutdown();
        assert!(published.lock().latest.is_none());
    }

    #[test]
    fn mode_switch_between_chunks_takes_effect_on_the_next_chunk() {
        let mut harness = Harness::spawn(64, 640, true);
        harness.producer.push_slice(&vec![500i16; 64]);
        let ev = recv_chunk_with_timeout(&mut harness.chunk_rx, Duration::from_secs(1));
        assert!(ev.calibrating);

        // Controller-side toggle: finish calibration, store the mean.
        {
            let mut cal = harness.calibration.lock();
            cal.mode = CaptureMode::Normal;
            let baseline = cal.estimator.finish_calibration().expect("one frame accumulated");
            cal.baseline = Some(Arc::new(baseline));
        }

        harness.producer.push_slice(&vec![500i16; 64]);
        let ev = recv_chunk_with_timeout(&mut harness.chunk_rx, Duration::from_secs(1));
        assert!(!ev.calibrating);

        // Identical input minus its own mean spectrum ≈ 0 everywhere.
        {
            let published = harness.published.lock();
            let latest = published.latest.as_ref().expect("snapshot published");
            for m in latest.magnitudes.iter() {
                assert_relative_eq!(*m, 0.0, epsilon = 1e-6);
            }
        }

        harness.shutdown();
    }
}
