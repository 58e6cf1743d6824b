//! Error types surfaced by station setup, acquisition, and capture.

use std::path::PathBuf;

use thiserror::Error;

use rfcontrol_shared::UnpackError;

/// Failures of a management operation. Each aborts only the requested operation.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("invalid station name {0:?}")]
    InvalidName(String),

    #[error("station {0} already exists")]
    DuplicateName(String),

    #[error("no station named {0}")]
    UnknownStation(String),

    #[error("no acquisition backend registered as {0}")]
    UnknownBackend(String),

    #[error("acquisition backend {backend} is already associated with station {station}")]
    BackendClaimed { backend: String, station: String },

    #[error("acquisition backend {0} is already registered")]
    DuplicateBackend(String),

    #[error("station {station} is already associated with backend {backend}")]
    AlreadyAssociated { station: String, backend: String },

    #[error("station {0} has no associated acquisition backend")]
    MissingAssociation(String),

    #[error("thread priority must be an integer in 0..=99, got {0:?}")]
    InvalidPriority(String),

    #[error("unknown setup command {0:?}")]
    UnknownCommand(String),

    #[error("backend {name} failed to initialize: {source}")]
    BackendInit {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to spawn control thread for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to access config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures reported by an acquisition backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// A read returned the all-ones sentinel
    #[error("hardware unavailable")]
    HardwareUnavailable,

    #[error(transparent)]
    InvalidChannel(#[from] UnpackError),

    #[error("backend is not associated with a board")]
    NotAssociated,

    #[error("register bus error: {0}")]
    Bus(String),
}

/// Failures of the demodulation capability.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("averaging window [{start}, {end}) holds no complete RF period")]
    EmptyWindow { start: usize, end: usize },

    #[error("waveform has {0} samples, fewer than one RF period")]
    ShortWaveform(usize),
}

/// Failure to persist a completed capture session.
#[derive(Error, Debug)]
#[error("failed to save {path}: {source}")]
pub struct CaptureError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
