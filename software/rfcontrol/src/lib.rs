//! Pulse-synchronous phase feedback, diagnostics and synchronized capture
//! for an LLRF station.
//!
//! A [`Manager`] owns named [`controller::Station`]s. Each station runs one
//! control thread gated by the board's per-pulse interrupt, reading the DAQ
//! through an [`backend::AcquisitionAdapter`] and steering the actuation
//! phase with a [`feedback::PhaseFeedbackController`].

pub mod backend;
pub mod capture;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod manager;
pub mod signal;

pub use controller::{ControlLoop, Settings, StationConfig, StationHandle, StationSnapshot};
pub use error::{BackendError, ConfigurationError};
pub use manager::{Manager, SetupCommand};
