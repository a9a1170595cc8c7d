use thiserror::Error;

/// All errors produced by earshot-core.
#[derive(Debug, Error)]
pub enum EarshotError {
    #[error("no usable audio input device found")]
    DeviceUnavailable,

    #[error("device '{device}' accepted no candidate sample rate")]
    NoValidConfiguration { device: String },

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EarshotError>;
