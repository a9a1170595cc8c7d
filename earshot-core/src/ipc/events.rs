//! Events emitted over the engine's broadcast channels.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Per-chunk events
// ---------------------------------------------------------------------------

/// Emitted once per published chunk.
///
/// Carries the calibration progress so a display layer can drive a sample
/// counter without polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEvent {
    /// Chunk counter for the snapshot just published. Strictly increasing
    /// and gapless across the engine's lifetime.
    pub counter: u64,
    /// Frames accumulated into the ambient baseline so far.
    pub calibration_samples: usize,
    /// Whether the chunk was consumed by calibration rather than corrected.
    pub calibrating: bool,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes, including mid-run stream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. the stream error message).
    pub detail: Option<String>,
}

/// Current state of the Earshot engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Actively capturing and publishing spectra.
    Listening,
    /// Capture stopped cleanly; engine may be restarted.
    Stopped,
    /// The audio stream failed mid-run; engine may be restarted.
    Error,
}
