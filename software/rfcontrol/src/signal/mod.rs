//! Digitized RF and analog channels and their per-pulse summaries.
//!
//! Channels are sized once to the backend's maximum sample count and reused
//! every pulse: the backend fills the raw samples, a [`SignalProcessor`]
//! derives I/Q, amplitude, phase and the windowed averages.

mod processor;

pub use processor::{NonIqProcessor, SignalProcessor};

use serde::{Deserialize, Serialize};

/// Wrap a phase in degrees into (-180, 180].
pub fn normalize_phase_deg(pha_deg: f64) -> f64 {
    let p = pha_deg % 360.0;
    if p > 180.0 {
        p - 360.0
    } else if p <= -180.0 {
        p + 360.0
    } else {
        p
    }
}

/// Acquisition metadata reported alongside a channel's samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelFrame {
    pub sample_rate_mhz: f64,
    pub sample_delay_ns: f64,
    pub point_count: usize,
    pub demod_coef_id: i64,
}

/// RF channels monitored by a station, in acquisition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfChannel {
    Reference,
    VmOutput,
    KlystronDrive,
    KlystronOutput,
    /// Primary phase feedback source
    SledOutput,
    /// Secondary phase feedback source
    AccRf,
    AccBeam,
}

impl RfChannel {
    pub const ALL: [RfChannel; 7] = [
        RfChannel::Reference,
        RfChannel::VmOutput,
        RfChannel::KlystronDrive,
        RfChannel::KlystronOutput,
        RfChannel::SledOutput,
        RfChannel::AccRf,
        RfChannel::AccBeam,
    ];

    /// Channels the control law reads, acquired before it runs
    pub const PHASE_CONTROL: [RfChannel; 3] =
        [RfChannel::Reference, RfChannel::SledOutput, RfChannel::AccRf];

    /// Channels acquired after the control law
    pub const MONITOR_ONLY: [RfChannel; 4] = [
        RfChannel::VmOutput,
        RfChannel::KlystronDrive,
        RfChannel::KlystronOutput,
        RfChannel::AccBeam,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Short operator-facing name
    pub fn label(self) -> &'static str {
        match self {
            RfChannel::Reference => "REF",
            RfChannel::VmOutput => "IQ MOD",
            RfChannel::KlystronDrive => "KLY DRV",
            RfChannel::KlystronOutput => "KLY OUT",
            RfChannel::SledOutput => "SLED OUT",
            RfChannel::AccRf => "ACC RF",
            RfChannel::AccBeam => "ACC BEAM",
        }
    }

    /// Identifier used in capture source names
    pub fn key(self) -> &'static str {
        match self {
            RfChannel::Reference => "ref",
            RfChannel::VmOutput => "vm_out",
            RfChannel::KlystronDrive => "kly_drive",
            RfChannel::KlystronOutput => "kly_out",
            RfChannel::SledOutput => "sled_out",
            RfChannel::AccRf => "acc_rf",
            RfChannel::AccBeam => "acc_beam",
        }
    }
}

/// Operator calibration for one channel.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct ChannelTuning {
    /// First sample of the averaging window
    pub avg_start: usize,
    /// One past the last sample of the averaging window
    pub avg_end: usize,
    /// Physical units per digit
    pub amp_scale: f64,
    /// Added to every measured phase
    pub pha_offset_deg: f64,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            avg_start: 0,
            avg_end: usize::MAX,
            amp_scale: 1.0,
            pha_offset_deg: 0.0,
        }
    }
}

/// One digitized RF channel.
#[derive(Clone, Debug)]
pub struct WaveformChannel {
    pub name: String,
    /// Logical DAQ channel the samples come from
    pub channel_id: usize,

    pub raw: Vec<i16>,
    pub wf_i: Vec<f64>,
    pub wf_q: Vec<f64>,
    pub wf_amp: Vec<f64>,
    pub wf_pha_deg: Vec<f64>,

    pub frame: ChannelFrame,
    pub tuning: ChannelTuning,

    pub avg_i: f64,
    pub avg_q: f64,
    pub avg_amp: f64,
    pub avg_pha_deg: f64,

    /// False when the last fetch or demodulation failed and the summaries are stale
    pub valid: bool,
}

impl WaveformChannel {
    pub fn new(name: &str, channel_id: usize, max_points: usize) -> Self {
        Self {
            name: name.to_owned(),
            channel_id,
            raw: vec![0; max_points],
            wf_i: vec![0.0; max_points],
            wf_q: vec![0.0; max_points],
            wf_amp: vec![0.0; max_points],
            wf_pha_deg: vec![0.0; max_points],
            frame: ChannelFrame::default(),
            tuning: ChannelTuning::default(),
            avg_i: 0.0,
            avg_q: 0.0,
            avg_amp: 0.0,
            avg_pha_deg: 0.0,
            valid: false,
        }
    }

    /// Number of samples the buffers can hold
    pub fn capacity(&self) -> usize {
        self.raw.len()
    }

    /// Samples delivered with the latest frame
    pub fn samples(&self) -> &[i16] {
        &self.raw[..self.point_count()]
    }

    pub fn point_count(&self) -> usize {
        self.frame.point_count.min(self.raw.len())
    }

    /// Averaging window clamped to the delivered samples
    pub fn window(&self) -> (usize, usize) {
        clamp_window(&self.tuning, self.point_count())
    }
}

/// One digitized non-RF channel, e.g. a high-voltage monitor.
#[derive(Clone, Debug)]
pub struct AnalogChannel {
    pub name: String,
    pub channel_id: usize,

    pub raw: Vec<i16>,
    /// Raw samples scaled to physical units
    pub values: Vec<f64>,

    pub frame: ChannelFrame,
    pub tuning: ChannelTuning,

    pub avg: f64,
    pub valid: bool,
}

impl AnalogChannel {
    pub fn new(name: &str, channel_id: usize, max_points: usize) -> Self {
        Self {
            name: name.to_owned(),
            channel_id,
            raw: vec![0; max_points],
            values: vec![0.0; max_points],
            frame: ChannelFrame::default(),
            tuning: ChannelTuning::default(),
            avg: 0.0,
            valid: false,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.raw[..self.point_count()]
    }

    pub fn point_count(&self) -> usize {
        self.frame.point_count.min(self.raw.len())
    }

    pub fn window(&self) -> (usize, usize) {
        clamp_window(&self.tuning, self.point_count())
    }
}

fn clamp_window(tuning: &ChannelTuning, point_count: usize) -> (usize, usize) {
    let end = tuning.avg_end.min(point_count);
    let start = tuning.avg_start.min(end);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn wraps_phase_into_half_open_range() {
        let cases = [
            (181.0, -179.0),
            (-181.0, 179.0),
            (540.0, 180.0),
            (-180.0, 180.0),
            (180.0, 180.0),
            (0.0, 0.0),
            (-720.5, -0.5),
            (359.0, -1.0),
        ];
        for (input, expected) in cases {
            let out = normalize_phase_deg(input);
            assert_abs_diff_eq!(out, expected, epsilon = 1e-9);
            assert!(out > -180.0 && out <= 180.0, "{input} wrapped to {out}");
        }
    }

    #[test]
    fn window_is_clamped_to_delivered_samples() {
        let mut ch = WaveformChannel::new("sled", 4, 512);
        ch.frame.point_count = 100;
        ch.tuning.avg_start = 40;
        ch.tuning.avg_end = 400;
        assert_eq!(ch.window(), (40, 100));

        ch.tuning.avg_start = 200;
        assert_eq!(ch.window(), (100, 100));
    }

    #[test]
    fn point_count_never_exceeds_capacity() {
        let mut ch = AnalogChannel::new("kly_hv", 9, 64);
        ch.frame.point_count = 512;
        assert_eq!(ch.samples().len(), 64);
    }
}
