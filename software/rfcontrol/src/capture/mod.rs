//! Synchronized multi-pulse capture to file.
//!
//! A fixed registry of scalar and waveform sources is recorded one slot per
//! pulse, for a fixed number of consecutive pulses, then written out. Each
//! output file is the concatenation of every source's record in registration
//! order with no header:
//!
//! * scalar file: `length` little-endian f64 per source
//! * waveform file: `length * points` little-endian i16 per source, pulse-major
//!
//! Consumers need the registry order (see [`SynchronizedCapture::scalar_names`]
//! and [`SynchronizedCapture::waveform_names`]) to split the file.

mod session;

pub use session::{CaptureSession, CaptureSource, Sample, SessionEvent};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::diagnostics::ChannelQuantity;
use crate::signal::RfChannel;

/// Scalar components of an RF channel summary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AverageComponent {
    I,
    Q,
    Amp,
    Pha,
}

impl AverageComponent {
    pub const ALL: [AverageComponent; 4] = [
        AverageComponent::I,
        AverageComponent::Q,
        AverageComponent::Amp,
        AverageComponent::Pha,
    ];

    fn suffix(self) -> &'static str {
        match self {
            AverageComponent::I => "avg_i",
            AverageComponent::Q => "avg_q",
            AverageComponent::Amp => "avg_amp",
            AverageComponent::Pha => "avg_pha",
        }
    }
}

impl From<ChannelQuantity> for AverageComponent {
    fn from(q: ChannelQuantity) -> Self {
        match q {
            ChannelQuantity::Amp => AverageComponent::Amp,
            ChannelQuantity::Pha => AverageComponent::Pha,
        }
    }
}

/// Live value a capture source records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKey {
    PhaseError,
    PhaseAdjustment,
    RfAverage(RfChannel, AverageComponent),
    RfRaw(RfChannel),
    AnalogAverage,
    AnalogRaw,
}

/// Read access to the values sources point at, taken once per pulse.
pub trait CaptureFrame {
    fn scalar(&self, key: SourceKey) -> f64;

    /// Raw samples for waveform keys; empty for anything else
    fn waveform(&self, key: SourceKey) -> &[i16];
}

/// Where completed sessions are written.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CaptureDestination {
    pub folder: PathBuf,
    pub scalar_file: String,
    pub waveform_file: String,
}

impl Default for CaptureDestination {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("."),
            scalar_file: "scalar_capture.bin".to_owned(),
            waveform_file: "waveform_capture.bin".to_owned(),
        }
    }
}

impl CaptureDestination {
    pub fn scalar_path(&self) -> PathBuf {
        self.folder.join(&self.scalar_file)
    }

    pub fn waveform_path(&self) -> PathBuf {
        self.folder.join(&self.waveform_file)
    }
}

/// Sources collected before the capture subsystem is built.
#[derive(Clone, Debug, Default)]
pub struct CaptureRegistry {
    scalars: Vec<(String, SourceKey)>,
    waveforms: Vec<(String, SourceKey, usize)>,
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: &str, key: SourceKey) -> Self {
        self.scalars.push((name.to_owned(), key));
        self
    }

    pub fn waveform(mut self, name: &str, key: SourceKey, points: usize) -> Self {
        self.waveforms.push((name.to_owned(), key, points));
        self
    }

    /// Feedback error and adjustment, then per RF channel its averages and raw
    /// samples, then the klystron beam voltage average and raw samples.
    pub fn station(points: usize) -> Self {
        let mut reg = Self::new()
            .scalar("fb_pha_err", SourceKey::PhaseError)
            .scalar("fb_pha_adj", SourceKey::PhaseAdjustment);
        for ch in RfChannel::ALL {
            for comp in AverageComponent::ALL {
                let name = format!("{}_{}", ch.key(), comp.suffix());
                reg = reg.scalar(&name, SourceKey::RfAverage(ch, comp));
            }
            reg = reg.waveform(&format!("{}_raw", ch.key()), SourceKey::RfRaw(ch), points);
        }
        reg.scalar("kly_beam_v_avg", SourceKey::AnalogAverage)
            .waveform("kly_beam_v_raw", SourceKey::AnalogRaw, points)
    }
}

/// Scalar and waveform capture sessions over a fixed source registry.
#[derive(Debug)]
pub struct SynchronizedCapture {
    scalar: CaptureSession<f64>,
    waveform: CaptureSession<i16>,
    status: String,
}

impl SynchronizedCapture {
    pub fn new(registry: CaptureRegistry, scalar_length: usize, waveform_length: usize) -> Self {
        let scalars = registry
            .scalars
            .into_iter()
            .map(|(name, key)| CaptureSource::new(name, key, 1, scalar_length))
            .collect();
        let waveforms = registry
            .waveforms
            .into_iter()
            .map(|(name, key, points)| CaptureSource::new(name, key, points, waveform_length))
            .collect();
        Self {
            scalar: CaptureSession::new(scalars, scalar_length),
            waveform: CaptureSession::new(waveforms, waveform_length),
            status: String::new(),
        }
    }

    pub fn scalar_session(&self) -> &CaptureSession<f64> {
        &self.scalar
    }

    pub fn waveform_session(&self) -> &CaptureSession<i16> {
        &self.waveform
    }

    /// Latest completion or failure message of either session
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn scalar_names(&self) -> Vec<String> {
        self.scalar.sources().iter().map(|s| s.name.clone()).collect()
    }

    pub fn waveform_names(&self) -> Vec<String> {
        self.waveform.sources().iter().map(|s| s.name.clone()).collect()
    }

    /// Advance the scalar session by one pulse.
    pub fn step_scalar(
        &mut self,
        triggered: bool,
        destination: &CaptureDestination,
        frame: &impl CaptureFrame,
    ) -> SessionEvent {
        let event = self.scalar.step(
            triggered,
            || destination.scalar_path(),
            |key, slot| slot[0] = frame.scalar(key),
        );
        self.note(&event, "scalar", self.scalar.length());
        event
    }

    /// Advance the waveform session by one pulse.
    pub fn step_waveform(
        &mut self,
        triggered: bool,
        destination: &CaptureDestination,
        frame: &impl CaptureFrame,
    ) -> SessionEvent {
        let event = self.waveform.step(
            triggered,
            || destination.waveform_path(),
            |key, slot| {
                let live = frame.waveform(key);
                let n = live.len().min(slot.len());
                slot[..n].copy_from_slice(&live[..n]);
                slot[n..].fill(0);
            },
        );
        self.note(&event, "waveform", self.waveform.length());
        event
    }

    fn note(&mut self, event: &SessionEvent, kind: &str, length: usize) {
        match event {
            SessionEvent::Started => info!("Started {kind} capture of {length} pulses"),
            SessionEvent::Completed(status) => {
                if status.ends_with("saved!") {
                    info!("{status}");
                } else {
                    error!("{kind} capture: {status}");
                }
                self.status = status.clone();
            }
            SessionEvent::Idle | SessionEvent::Recording => {}
        }
    }
}
