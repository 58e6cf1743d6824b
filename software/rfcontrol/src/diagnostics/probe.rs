//! Operator-selectable probes onto a station's per-pulse results.

use rfcontrol_shared::enum_with_unknown;

use super::HistoryRing;
use crate::signal::RfChannel;

enum_with_unknown! {
    /// Quantity a probe reads, as numbered on the operator panel
    pub enum ProbeSource(u32) {
        PhaseError = 0,
        PhaseAdjustment = 1,
        RefAmp = 2,
        RefPha = 3,
        VmOutAmp = 4,
        VmOutPha = 5,
        KlyDriveAmp = 6,
        KlyDrivePha = 7,
        KlyOutAmp = 8,
        KlyOutPha = 9,
        SledOutAmp = 10,
        SledOutPha = 11,
        AccRfAmp = 12,
        AccRfPha = 13,
        AccBeamAmp = 14,
        AccBeamPha = 15,
        KlyBeamVoltage = 16,
    }
}

/// Which value of an RF channel a probe reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelQuantity {
    Amp,
    Pha,
}

/// Resolved meaning of a [`ProbeSource`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeTarget {
    PhaseError,
    PhaseAdjustment,
    Rf(RfChannel, ChannelQuantity),
    KlyBeamVoltage,
    None,
}

impl ProbeSource {
    pub fn target(self) -> ProbeTarget {
        use ChannelQuantity::*;
        use ProbeTarget::*;
        match self {
            ProbeSource::PhaseError => PhaseError,
            ProbeSource::PhaseAdjustment => PhaseAdjustment,
            ProbeSource::RefAmp => Rf(RfChannel::Reference, Amp),
            ProbeSource::RefPha => Rf(RfChannel::Reference, Pha),
            ProbeSource::VmOutAmp => Rf(RfChannel::VmOutput, Amp),
            ProbeSource::VmOutPha => Rf(RfChannel::VmOutput, Pha),
            ProbeSource::KlyDriveAmp => Rf(RfChannel::KlystronDrive, Amp),
            ProbeSource::KlyDrivePha => Rf(RfChannel::KlystronDrive, Pha),
            ProbeSource::KlyOutAmp => Rf(RfChannel::KlystronOutput, Amp),
            ProbeSource::KlyOutPha => Rf(RfChannel::KlystronOutput, Pha),
            ProbeSource::SledOutAmp => Rf(RfChannel::SledOutput, Amp),
            ProbeSource::SledOutPha => Rf(RfChannel::SledOutput, Pha),
            ProbeSource::AccRfAmp => Rf(RfChannel::AccRf, Amp),
            ProbeSource::AccRfPha => Rf(RfChannel::AccRf, Pha),
            ProbeSource::AccBeamAmp => Rf(RfChannel::AccBeam, Amp),
            ProbeSource::AccBeamPha => Rf(RfChannel::AccBeam, Pha),
            ProbeSource::KlyBeamVoltage => KlyBeamVoltage,
            ProbeSource::Unknown(_) => None,
        }
    }

    /// Operator-facing description
    pub fn label(self) -> &'static str {
        match self {
            ProbeSource::PhaseError => "Pul-pul FB pha err (deg)",
            ProbeSource::PhaseAdjustment => "Pul-pul FB pha adj (deg)",
            ProbeSource::RefAmp => "REF amp",
            ProbeSource::RefPha => "REF pha (deg)",
            ProbeSource::VmOutAmp => "IQ MOD amp",
            ProbeSource::VmOutPha => "IQ MOD pha (deg)",
            ProbeSource::KlyDriveAmp => "KLY DRV amp",
            ProbeSource::KlyDrivePha => "KLY DRV pha (deg)",
            ProbeSource::KlyOutAmp => "KLY OUT amp",
            ProbeSource::KlyOutPha => "KLY OUT pha (deg)",
            ProbeSource::SledOutAmp => "SLED OUT amp",
            ProbeSource::SledOutPha => "SLED OUT pha (deg)",
            ProbeSource::AccRfAmp => "ACC RF amp",
            ProbeSource::AccRfPha => "ACC RF pha (deg)",
            ProbeSource::AccBeamAmp => "ACC BEAM amp",
            ProbeSource::AccBeamPha => "ACC BEAM pha (deg)",
            ProbeSource::KlyBeamVoltage => "KLY HV amp",
            ProbeSource::Unknown(_) => "Not supported",
        }
    }
}

/// One probe: a selector, its latest reading, and that reading's history.
#[derive(Clone, Debug)]
pub struct Probe {
    pub source: ProbeSource,
    pub value: f64,
    pub history: HistoryRing,
}

impl Probe {
    pub fn new(source: ProbeSource, history_depth: usize) -> Self {
        Self {
            source,
            value: 0.0,
            history: HistoryRing::new(history_depth),
        }
    }

    pub fn label(&self) -> &'static str {
        self.source.label()
    }

    /// Take this pulse's reading through `read` and append it to the history.
    ///
    /// Unsupported selectors read 0.
    pub fn sample(&mut self, selector: u32, read: impl FnOnce(ProbeTarget) -> Option<f64>) {
        self.source = ProbeSource::from(selector);
        self.value = match self.source.target() {
            ProbeTarget::None => 0.0,
            target => read(target).unwrap_or(0.0),
        };
        self.history.push(self.value);
    }
}
