//! End-to-end acquisition pipeline tests driven through the public API,
//! with synthetic samples instead of a live input device.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};

use earshot_core::audio::StreamErrorFlag;
use earshot_core::buffering::{chunk::AudioChunk, create_sample_ring, Producer, SampleProducer};
use earshot_core::engine::{
    pipeline::{self, PipelineContext, PipelineDiagnostics},
    CalibrationState, CaptureMode, PublishedState,
};
use earshot_core::ipc::events::{ChunkEvent, EngineStatus, EngineStatusEvent};
use earshot_core::spectrum::peaks::{find_peaks, DEFAULT_RELATIVE_THRESHOLD};
use earshot_core::spectrum::SpectralTransform;

const RATE: u32 = 4_000;
const CHUNK: usize = 400;

struct TestPipeline {
    producer: SampleProducer,
    running: Arc<AtomicBool>,
    calibration: Arc<Mutex<CalibrationState>>,
    published: Arc<Mutex<PublishedState>>,
    diagnostics: Arc<PipelineDiagnostics>,
    chunk_rx: broadcast::Receiver<ChunkEvent>,
    handle: thread::JoinHandle<()>,
}

impl TestPipeline {
    fn spawn(calibrating: bool) -> Self {
        let (producer, consumer) = create_sample_ring();
        let running = Arc::new(AtomicBool::new(true));
        let mut initial = CalibrationState::default();
        if calibrating {
            initial.mode = CaptureMode::Calibrating;
            initial.estimator.start_calibration();
        }
        let calibration = Arc::new(Mutex::new(initial));
        let published = Arc::new(Mutex::new(PublishedState::default()));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let (chunk_tx, chunk_rx) = broadcast::channel(64);
        let (status_tx, _status_rx) = broadcast::channel::<EngineStatusEvent>(8);

        let ctx = PipelineContext {
            chunk_size: CHUNK,
            sample_rate: RATE,
            consumer,
            running: Arc::clone(&running),
            stream_error: Arc::new(StreamErrorFlag::new()),
            calibration: Arc::clone(&calibration),
            published: Arc::clone(&published),
            chunks_read: Arc::new(AtomicU64::new(0)),
            chunk_tx,
            status_tx,
            status: Arc::new(Mutex::new(EngineStatus::Listening)),
            diagnostics: Arc::clone(&diagnostics),
        };

        let handle = thread::spawn(move || pipeline::run(ctx));

        Self {
            producer,
            running,
            calibration,
            published,
            diagnostics,
            chunk_rx,
            handle,
        }
    }

    fn next_event(&mut self) -> ChunkEvent {
        let start = Instant::now();
        loop {
            match self.chunk_rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= Duration::from_secs(2) {
                        panic!("timed out waiting for chunk event");
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("chunk channel closed"),
            }
        }
    }

    fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        self.handle.join().expect("acquisition thread panicked");
    }
}

/// 25 cycles over 400 samples at 4 kHz → a 250 Hz tone landing on bin 25.
fn tone_chunk(amplitude: f64) -> Vec<i16> {
    (0..CHUNK)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * 25.0 * i as f64 / CHUNK as f64;
            (amplitude * phase.sin()) as i16
        })
        .collect()
}

#[test]
fn silent_calibration_then_tone_reports_the_tone_bin() {
    let mut pipe = TestPipeline::spawn(true);

    // Five silent chunks while calibrating: the learned baseline is all-zero.
    for _ in 0..5 {
        pipe.producer.push_slice(&vec![0i16; CHUNK]);
    }
    for expected in 1..=5usize {
        let ev = pipe.next_event();
        assert!(ev.calibrating);
        assert_eq!(ev.calibration_samples, expected);
    }

    {
        let mut cal = pipe.calibration.lock();
        cal.mode = CaptureMode::Normal;
        let baseline = cal
            .estimator
            .finish_calibration()
            .expect("five frames accumulated");
        assert_eq!(baseline.frames, 5);
        assert!(baseline.values.iter().all(|v| *v == 0.0));
        cal.baseline = Some(Arc::new(baseline));
    }

    // With a zero baseline the corrected frame equals the raw transform.
    let tone = tone_chunk(8_000.0);
    pipe.producer.push_slice(&tone);
    let ev = pipe.next_event();
    assert!(!ev.calibrating);
    assert_eq!(ev.counter, 6);

    let expected = SpectralTransform::new()
        .transform(&AudioChunk::new(tone, RATE))
        .magnitudes;

    {
        let published = pipe.published.lock();
        let latest = published.latest.as_ref().expect("snapshot published");
        assert_eq!(latest.counter, 6);
        assert_eq!(latest.magnitudes.len(), CHUNK / 2);
        for (got, want) in latest.magnitudes.iter().zip(&expected) {
            assert_relative_eq!(*got, *want, max_relative = 1e-9);
        }

        // Peak detection against the running maximum finds the 250 Hz bin.
        let peaks = find_peaks(
            &latest.magnitudes,
            DEFAULT_RELATIVE_THRESHOLD,
            published.max_magnitude,
        );
        assert!(peaks.contains(&25), "expected bin 25 among peaks: {peaks:?}");
        assert_relative_eq!(latest.freq_axis[25], 250.0, max_relative = 1e-12);
    }

    pipe.shutdown();
}

#[test]
fn counters_stay_gapless_across_partial_ring_writes() {
    let mut pipe = TestPipeline::spawn(false);

    // Deliver 3 chunks' worth of samples in uneven slices, the way a real
    // callback delivers device-period-sized blocks.
    let total = CHUNK * 3;
    let samples = vec![250i16; total];
    let mut offset = 0;
    for slice_len in [150usize, 500, 90, 260, 200] {
        pipe.producer.push_slice(&samples[offset..offset + slice_len]);
        offset += slice_len;
        thread::sleep(Duration::from_millis(1));
    }
    pipe.producer.push_slice(&samples[offset..]);

    let counters: Vec<u64> = (0..3).map(|_| pipe.next_event().counter).collect();
    assert_eq!(counters, vec![1, 2, 3]);

    let snap = pipe.diagnostics.snapshot();
    assert_eq!(snap.chunks_published, 3);
    assert_eq!(snap.frames_raw, 3);
    assert_eq!(snap.frames_accumulated, 0);
    assert_eq!(snap.stream_errors, 0);

    pipe.shutdown();
}

#[test]
fn baseline_subtraction_suppresses_a_constant_tone() {
    let mut pipe = TestPipeline::spawn(true);
    let tone = tone_chunk(4_000.0);

    // Calibrate on the tone itself.
    for _ in 0..4 {
        pipe.producer.push_slice(&tone);
    }
    for _ in 0..4 {
        let ev = pipe.next_event();
        assert!(ev.calibrating);
    }

    {
        let mut cal = pipe.calibration.lock();
        cal.mode = CaptureMode::Normal;
        let baseline = cal.estimator.finish_calibration().expect("frames accumulated");
        cal.baseline = Some(Arc::new(baseline));
    }

    // The same tone after calibration cancels to ≈0 in every bin.
    pipe.producer.push_slice(&tone);
    let ev = pipe.next_event();
    assert!(!ev.calibrating);

    {
        let published = pipe.published.lock();
        let latest = published.latest.as_ref().expect("snapshot published");
        for m in latest.magnitudes.iter() {
            assert_relative_eq!(*m, 0.0, epsilon = 1e-6);
        }
    }

    pipe.shutdown();
}

#[test]
fn published_snapshots_are_internally_consistent_under_polling() {
    let mut pipe = TestPipeline::spawn(false);

    // Concurrent reader polls the published state while chunks flow.
    let published = Arc::clone(&pipe.published);
    let reader = thread::spawn(move || {
        let mut last_counter = 0u64;
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            {
                let state = published.lock();
                if let Some(latest) = state.latest.as_ref() {
                    // Counter never moves backwards and payloads always agree
                    // in shape with one another.
                    assert!(latest.counter >= last_counter);
                    last_counter = latest.counter;
                    assert_eq!(latest.samples.len(), CHUNK);
                    assert_eq!(latest.magnitudes.len(), CHUNK / 2);
                    assert_eq!(latest.freq_axis.len(), CHUNK / 2);
                    assert_eq!(latest.time_axis.len(), CHUNK);
                }
            }
            thread::sleep(Duration::from_millis(3));
        }
        last_counter
    });

    for _ in 0..10 {
        pipe.producer.push_slice(&vec![300i16; CHUNK]);
        let _ = pipe.next_event();
    }

    let observed = reader.join().expect("reader thread panicked");
    assert!(observed >= 1, "reader never saw a published snapshot");

    pipe.shutdown();
}
