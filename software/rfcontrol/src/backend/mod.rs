//! Acquisition backends: one implementation per board firmware.
//!
//! A station holds exactly one `Box<dyn AcquisitionAdapter>`, chosen when it
//! is associated and never swapped afterward.

use std::time::Duration;

use rfcontrol_shared::registers::InterruptCounters;

use crate::error::BackendError;
use crate::signal::ChannelFrame;

mod simulated;
mod sis8300;

pub use simulated::{SimulatedBoard, SimulatedBoardHandle, Tone};
pub use sis8300::{Sis8300Config, Sis8300Iqfb};

/// Outcome of waiting for the per-pulse interrupt.
#[derive(Clone, Debug, PartialEq)]
pub enum InterruptWait {
    /// A pulse arrived
    Event,
    /// The bounded wait elapsed without a pulse
    TimedOut,
    Failed(BackendError),
}

/// Opaque register-level access to a digitizer board.
///
/// Implemented by the board driver; chip bring-up happens behind it.
pub trait RegisterBus: Send {
    fn read_register(&mut self, addr: u32) -> Result<u32, BackendError>;

    fn write_register(&mut self, addr: u32, value: u32) -> Result<(), BackendError>;

    /// Read `out.len()` consecutive words starting at `addr`.
    fn read_block(&mut self, addr: u32, out: &mut [u32]) -> Result<(), BackendError>;

    /// Block until the next user interrupt or until `timeout` passes.
    /// Returns `true` if an interrupt arrived.
    fn wait_interrupt(&mut self, timeout: Duration) -> Result<bool, BackendError>;
}

/// Named I/Q waveform pair produced by the firmware's internal signal chain.
#[derive(Clone, Debug)]
pub struct IqWaveform {
    pub name: &'static str,
    /// Even logical DAQ channel carrying I (high half) and Q (low half)
    pub channel_id: Option<usize>,
    pub wf_i: Vec<i16>,
    pub wf_q: Vec<i16>,
}

impl IqWaveform {
    pub fn new(name: &'static str, channel_id: Option<usize>, points: usize) -> Self {
        Self {
            name,
            channel_id,
            wf_i: vec![0; points],
            wf_q: vec![0; points],
        }
    }
}

/// Capabilities the control loop needs from a board firmware.
pub trait AcquisitionAdapter: Send {
    /// Name of the implementation, for logs
    fn kind(&self) -> String {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or_default()
            .to_owned()
    }

    /// Prepare the firmware after association: read identification and
    /// program a neutral signal chain.
    fn init(&mut self) -> Result<(), BackendError>;

    /// Attach the board this firmware runs on.
    fn associate(&mut self, board: Box<dyn RegisterBus>) -> Result<(), BackendError>;

    /// Largest number of samples any channel can deliver
    fn max_sample_count(&self) -> usize;

    /// Bulk transfer of all DAQ buffers into the local cache.
    ///
    /// The cache is updated even when the board reads back as unavailable.
    fn pull_daq_buffer(&mut self) -> Result<(), BackendError>;

    /// Copy one channel out of the local cache into `out`.
    fn channel_samples(&self, channel: usize, out: &mut [i16]) -> Result<ChannelFrame, BackendError>;

    /// Refresh the firmware's internal diagnostic waveforms from the local cache.
    fn refresh_internal_waveforms(&mut self) -> Result<(), BackendError>;

    /// The internal diagnostic waveforms as of the last refresh
    fn internal_waveforms(&self) -> &[IqWaveform];

    /// Rotate the actuation by `delta_deg`, relative to the current setting.
    fn apply_phase_adjustment(&mut self, delta_deg: f64) -> Result<(), BackendError>;

    fn wait_for_interrupt(&mut self, timeout: Duration) -> InterruptWait;

    /// Read the interrupt delay and pulse counters.
    ///
    /// Returns the raw counters; an all-ones pulse count means the board is unavailable.
    fn measure_interrupt_latency(&mut self) -> Result<InterruptCounters, BackendError>;
}

/// Anything that can take a relative phase correction.
pub trait PhaseActuator {
    fn apply_phase_adjustment(&mut self, delta_deg: f64) -> Result<(), BackendError>;
}

impl<T: AcquisitionAdapter + ?Sized> PhaseActuator for T {
    fn apply_phase_adjustment(&mut self, delta_deg: f64) -> Result<(), BackendError> {
        AcquisitionAdapter::apply_phase_adjustment(self, delta_deg)
    }
}
