//! Terminal monitor for the earshot engine.
//!
//! Opens the microphone, optionally learns an ambient baseline, then polls
//! the latest published snapshot and prints detected spectral peaks. Intended
//! both as a usable tool and as the reference consumer of `earshot-core`.

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use earshot_core::{
    audio::device::list_input_devices, EarshotEngine, EngineConfig, EngineStatus,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "earshot-monitor",
    about = "Live microphone spectrum monitor with ambient-baseline subtraction",
    version
)]
struct Args {
    /// Input device name (substring match not supported; use --list-devices).
    #[arg(long)]
    device: Option<String>,

    /// Requested sample rate in Hz. Defaults to trying 44100 first.
    #[arg(long)]
    rate: Option<u32>,

    /// Chunks per second; chunk size = rate / this value.
    #[arg(long, default_value_t = 10)]
    updates_per_second: u32,

    /// Fraction of the running maximum a bin must reach to count as a peak.
    #[arg(long, default_value_t = 0.1)]
    threshold: f64,

    /// Seconds of ambient calibration before monitoring starts. 0 disables.
    #[arg(long, default_value_t = 2)]
    calibrate_secs: u64,

    /// How long to monitor before exiting. 0 runs until Ctrl-C kills us.
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,

    /// List input-capable devices and exit.
    #[arg(long)]
    list_devices: bool,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "earshot=info".parse().expect("valid default filter")),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        let devices = list_input_devices();
        if devices.is_empty() {
            println!("no input-capable devices found");
            return Ok(());
        }
        for d in devices {
            let marker = if d.is_default { "*" } else { " " };
            println!(
                "{marker} {}  ({} Hz, {} ch)",
                d.name, d.default_sample_rate, d.input_channels
            );
        }
        return Ok(());
    }

    let engine = EarshotEngine::new(EngineConfig {
        device: args.device.clone(),
        sample_rate: args.rate,
        updates_per_second: args.updates_per_second,
        peak_relative_threshold: args.threshold,
    });

    let mut status_rx = engine.subscribe_status();
    engine.start().context("failed to start capture")?;

    if args.calibrate_secs > 0 {
        info!(secs = args.calibrate_secs, "learning ambient baseline — keep quiet");
        engine.set_calibrating(true);
        std::thread::sleep(Duration::from_secs(args.calibrate_secs));
        engine.set_calibrating(false);
        match engine.baseline() {
            Some(baseline) => info!(frames = baseline.frames, "ambient baseline ready"),
            None => warn!("no frames captured during calibration; running uncorrected"),
        }
    }

    let started = Instant::now();
    let mut last_counter = 0u64;

    loop {
        if args.duration_secs > 0 && started.elapsed() >= Duration::from_secs(args.duration_secs) {
            break;
        }

        // Surface mid-run stream failures pushed by the engine.
        while let Ok(event) = status_rx.try_recv() {
            if event.status == EngineStatus::Error {
                let detail = event.detail.unwrap_or_else(|| "unknown".into());
                anyhow::bail!("audio stream failed: {detail}");
            }
        }
        if !engine.is_running() {
            warn!("engine stopped unexpectedly");
            break;
        }

        if let Some(snapshot) = engine.latest_snapshot() {
            if snapshot.counter != last_counter {
                last_counter = snapshot.counter;
                print_snapshot(&snapshot);
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    engine.stop().context("failed to stop capture")?;
    let diag = engine.diagnostics_snapshot();
    info!(
        chunks = diag.chunks_published,
        corrected = diag.frames_corrected,
        raw = diag.frames_raw,
        "monitor session finished"
    );
    Ok(())
}

fn print_snapshot(snapshot: &earshot_core::Snapshot) {
    if snapshot.peaks.is_empty() {
        println!(
            "[{:>8}] amp {:>7.0}  (no peaks)",
            snapshot.counter, snapshot.max_amplitude
        );
        return;
    }

    let peaks: Vec<String> = snapshot
        .peaks
        .iter()
        .map(|&i| format!("{:.0} Hz", snapshot.freq_axis[i]))
        .collect();
    println!(
        "[{:>8}] amp {:>7.0}  peaks: {}",
        snapshot.counter,
        snapshot.max_amplitude,
        peaks.join(", ")
    );
}
