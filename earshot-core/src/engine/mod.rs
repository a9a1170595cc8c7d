//! `EarshotEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! EarshotEngine::new(config)
//!     └─► start()                 → device open, loop spawned, status = Listening
//!         ├─► set_calibrating(b)  → toggle ambient-baseline learning
//!         ├─► reset()             → discard baseline + maxima, loop keeps running
//!         └─► stop()              → running=false, thread joined, status = Stopped
//! ```
//!
//! `start()`/`stop()` return an error rather than panicking when called in
//! the wrong state.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). `AudioCapture` is therefore created *inside* the acquisition
//! thread so it never crosses a thread boundary; a sync channel propagates
//! any open-device error back to the `start()` caller. The acquisition thread
//! is the only writer of the published snapshot, the baseline accumulator and
//! the running maxima — everything else reads through the shared mutexes.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::{AudioCapture, StreamErrorFlag},
    buffering::{chunk::AudioChunk, create_sample_ring},
    error::{EarshotError, Result},
    ipc::events::{ChunkEvent, EngineStatus, EngineStatusEvent},
    spectrum::baseline::{BaselineEstimator, BaselineSpectrum},
    spectrum::peaks,
};

/// Broadcast channel capacity: enough chunk events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `EarshotEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Preferred input device name. `None` picks the first device that
    /// passes the capability probe.
    pub device: Option<String>,
    /// Requested sample rate (Hz). `None` tries the candidate list,
    /// 44100 first.
    pub sample_rate: Option<u32>,
    /// Chunk cadence: chunk size = rate / updates_per_second.
    /// Default: 10.
    pub updates_per_second: u32,
    /// Fraction of the running maximum magnitude a bin must reach to be
    /// reported as a peak. Default: 0.1.
    pub peak_relative_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: None,
            updates_per_second: 10,
            peak_relative_threshold: peaks::DEFAULT_RELATIVE_THRESHOLD,
        }
    }
}

/// Sub-mode while capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Frames are baseline-corrected (when a baseline exists) and published.
    Normal,
    /// Frames are accumulated into the ambient baseline.
    Calibrating,
}

/// Calibration-side state shared between controller and acquisition loop.
///
/// Guarded by a single mutex so a mode toggle and the loop's
/// check-mode-then-branch step can never interleave.
pub struct CalibrationState {
    pub mode: CaptureMode,
    pub estimator: BaselineEstimator,
    pub baseline: Option<Arc<BaselineSpectrum>>,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Normal,
            estimator: BaselineEstimator::new(),
            baseline: None,
        }
    }
}

/// The most recently published acquisition cycle.
pub struct LatestFrame {
    pub counter: u64,
    pub samples: Arc<Vec<i16>>,
    pub time_axis: Arc<Vec<f64>>,
    pub magnitudes: Arc<Vec<f64>>,
    pub freq_axis: Arc<Vec<f64>>,
}

/// Published snapshot plus the session's running maxima, swapped atomically
/// under one mutex so readers never observe a torn update.
#[derive(Default)]
pub struct PublishedState {
    pub latest: Option<LatestFrame>,
    /// Largest absolute sample value seen this session (display auto-scale).
    pub max_amplitude: f64,
    /// Largest published magnitude seen this session; the peak-detection
    /// reference maximum.
    pub max_magnitude: f64,
}

/// Read-only copy of the latest published state handed to consumers.
///
/// Heavy payloads are shared `Arc`s; cloning a snapshot is cheap.
#[derive(Clone)]
pub struct Snapshot {
    /// Strictly increasing, gapless chunk counter.
    pub counter: u64,
    /// The chunk's mono i16 samples.
    pub samples: Arc<Vec<i16>>,
    /// Per-sample time offsets in seconds.
    pub time_axis: Arc<Vec<f64>>,
    /// Published (possibly baseline-corrected) magnitude frame.
    pub magnitudes: Arc<Vec<f64>>,
    /// Frequency-bin centers in Hz.
    pub freq_axis: Arc<Vec<f64>>,
    /// Peak indices into `magnitudes`, thresholded against `max_magnitude`.
    /// Recomputed at read time, never persisted.
    pub peaks: Vec<usize>,
    pub max_amplitude: f64,
    pub max_magnitude: f64,
}

/// The top-level engine handle.
///
/// `EarshotEngine` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc` to share between a UI layer and event-forwarding tasks.
pub struct EarshotEngine {
    config: EngineConfig,
    /// `true` while capture + acquisition loop are active.
    running: Arc<AtomicBool>,
    /// Canonical status (written via Mutex, read from commands).
    status: Arc<Mutex<EngineStatus>>,
    calibration: Arc<Mutex<CalibrationState>>,
    published: Arc<Mutex<PublishedState>>,
    /// Engine-lifetime chunk counter; never reset, so polling consumers
    /// never observe a rollback across restarts.
    chunks_read: Arc<AtomicU64>,
    chunk_tx: broadcast::Sender<ChunkEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EarshotEngine {
    /// Create a new engine. Does not touch any device — call `start()`.
    pub fn new(config: EngineConfig) -> Self {
        let (chunk_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            calibration: Arc::new(Mutex::new(CalibrationState::default())),
            published: Arc::new(Mutex::new(PublishedState::default())),
            chunks_read: Arc::new(AtomicU64::new(0)),
            chunk_tx,
            status_tx,
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
            worker: Mutex::new(None),
        }
    }

    /// Start capture and the acquisition loop using the configured device.
    ///
    /// Blocks until the audio device is confirmed open (or fails), then
    /// returns; the loop continues on a dedicated background thread.
    ///
    /// # Errors
    /// - `EarshotError::AlreadyRunning` if already started.
    /// - `EarshotError::DeviceUnavailable` / `NoValidConfiguration` /
    ///   `Stream` on device errors.
    pub fn start(&self) -> Result<()> {
        self.start_with_device(self.config.device.clone())
    }

    /// Start the engine using a specific input device name, overriding the
    /// configured one.
    pub fn start_with_device(&self, preferred_device: Option<String>) -> Result<()> {
        // Single atomic claim: a racing second start() loses here instead of
        // both passing a separate check and store.
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EarshotError::AlreadyRunning);
        }

        self.diagnostics.reset();
        // A run always begins in Normal mode; a stored baseline stays active.
        // Any accumulator left by a run that died mid-calibration is stale,
        // so the reported calibration progress starts from zero.
        {
            let mut cal = self.calibration.lock();
            cal.mode = CaptureMode::Normal;
            cal.estimator.reset();
        }

        let (producer, consumer) = create_sample_ring();
        let error_flag = Arc::new(StreamErrorFlag::new());

        // Clone all Arc-wrapped state before moving into the thread.
        let running = Arc::clone(&self.running);
        let calibration = Arc::clone(&self.calibration);
        let published = Arc::clone(&self.published);
        let chunks_read = Arc::clone(&self.chunks_read);
        let chunk_tx = self.chunk_tx.clone();
        let status_tx = self.status_tx.clone();
        let status = Arc::clone(&self.status);
        let diagnostics = Arc::clone(&self.diagnostics);
        let updates_per_second = self.config.updates_per_second;
        let requested_rate = self.config.sample_rate;

        // Sync oneshot: acquisition thread signals open success/failure back
        // to start(). Carries the actual capture sample rate on success.
        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();

        let spawned = thread::Builder::new()
            .name("earshot-acquisition".into())
            .spawn(move || {
                // Open the device on THIS thread — cpal::Stream is !Send.
                let capture = match AudioCapture::open(
                    producer,
                    Arc::clone(&running),
                    Arc::clone(&error_flag),
                    preferred_device.as_deref(),
                    requested_rate,
                ) {
                    Ok(c) => {
                        let _ = open_tx.send(Ok(c.sample_rate));
                        c
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                let chunk_size =
                    AudioChunk::size_for(capture.sample_rate, updates_per_second);

                pipeline::run(pipeline::PipelineContext {
                    chunk_size,
                    sample_rate: capture.sample_rate,
                    consumer,
                    running,
                    stream_error: error_flag,
                    calibration,
                    published,
                    chunks_read,
                    chunk_tx,
                    status_tx,
                    status,
                    diagnostics,
                });

                capture.stop();
                // Stream drops here, releasing the audio device on this thread.
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The claim above must not outlive a failed spawn.
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        // Block until device open is confirmed (receives actual sample rate).
        match open_rx.recv() {
            Ok(Ok(rate)) => {
                *self.worker.lock() = Some(handle);
                self.set_status(EngineStatus::Listening, None);
                info!(sample_rate = rate, "engine started — capturing");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent.
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("acquisition thread died".into()));
                let _ = handle.join();
                Err(EarshotError::Other(anyhow::anyhow!(
                    "acquisition thread died before confirming device open"
                )))
            }
        }
    }

    /// Stop the acquisition loop and release the device.
    ///
    /// Blocks until the acquisition thread has exited, which guarantees the
    /// device handle was dropped and no read is still in flight.
    ///
    /// # Errors
    /// - `EarshotError::NotRunning` if there is nothing to stop.
    pub fn stop(&self) -> Result<()> {
        let handle = self.worker.lock().take();
        if handle.is_none() && !self.running.load(Ordering::SeqCst) {
            return Err(EarshotError::NotRunning);
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("acquisition thread panicked during shutdown");
            }
        }

        // A mid-run stream failure already reported Error; keep that visible.
        if *self.status.lock() != EngineStatus::Error {
            self.set_status(EngineStatus::Stopped, None);
        }
        info!("engine stopped");
        Ok(())
    }

    /// Toggle ambient-baseline learning.
    ///
    /// `true` starts a fresh calibration window: accumulator, count and the
    /// previously stored baseline are discarded. `false` finalises the mean
    /// and stores it as the active baseline when at least one frame was
    /// accumulated. Calling with the current mode is a no-op, so
    /// `set_calibrating(false)` without a preceding `true` does nothing.
    pub fn set_calibrating(&self, enabled: bool) {
        let mut cal = self.calibration.lock();
        match (cal.mode, enabled) {
            (CaptureMode::Normal, true) => {
                cal.mode = CaptureMode::Calibrating;
                cal.baseline = None;
                cal.estimator.start_calibration();
                info!("ambient calibration started");
            }
            (CaptureMode::Calibrating, false) => {
                cal.mode = CaptureMode::Normal;
                match cal.estimator.finish_calibration() {
                    Some(baseline) => {
                        info!(frames = baseline.frames, "ambient baseline established");
                        cal.baseline = Some(Arc::new(baseline));
                    }
                    None => {
                        warn!("calibration ended with no accumulated frames — no baseline");
                    }
                }
            }
            _ => {}
        }
    }

    /// Discard the baseline, any in-progress accumulation and the running
    /// maxima; forces the sub-mode back to Normal. Valid in any state and
    /// does not stop a running loop.
    pub fn reset(&self) {
        {
            let mut cal = self.calibration.lock();
            cal.mode = CaptureMode::Normal;
            cal.estimator.reset();
            cal.baseline = None;
        }
        {
            let mut published = self.published.lock();
            published.max_amplitude = 0.0;
            published.max_magnitude = 0.0;
        }
        info!("baseline and running maxima cleared");
    }

    /// Non-blocking copy of the most recent published snapshot, with peak
    /// indices computed against the session's running maximum magnitude.
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        let published = self.published.lock();
        let latest = published.latest.as_ref()?;
        let peak_indices = peaks::find_peaks(
            &latest.magnitudes,
            self.config.peak_relative_threshold,
            published.max_magnitude,
        );
        Some(Snapshot {
            counter: latest.counter,
            samples: Arc::clone(&latest.samples),
            time_axis: Arc::clone(&latest.time_axis),
            magnitudes: Arc::clone(&latest.magnitudes),
            freq_axis: Arc::clone(&latest.freq_axis),
            peaks: peak_indices,
            max_amplitude: published.max_amplitude,
            max_magnitude: published.max_magnitude,
        })
    }

    /// Frames accumulated into the baseline so far (for progress display).
    pub fn calibration_sample_count(&self) -> usize {
        self.calibration.lock().estimator.sample_count()
    }

    /// The currently active baseline, if one has been established.
    pub fn baseline(&self) -> Option<Arc<BaselineSpectrum>> {
        self.calibration.lock().baseline.clone()
    }

    /// Current capture sub-mode.
    pub fn mode(&self) -> CaptureMode {
        self.calibration.lock().mode
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total chunks published over the engine's lifetime.
    pub fn chunks_read(&self) -> u64 {
        self.chunks_read.load(Ordering::Relaxed)
    }

    /// Subscribe to per-chunk events (one per published snapshot).
    pub fn subscribe_chunks(&self) -> broadcast::Receiver<ChunkEvent> {
        self.chunk_tx.subscribe()
    }

    /// Subscribe to status change events, including mid-run stream failures.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of acquisition counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }
}
