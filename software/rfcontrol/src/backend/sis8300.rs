//! SIS8300 digitizer running the DESY IQ feedback firmware.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rfcontrol_shared::PackedLayout;
use rfcontrol_shared::daq::{DAQ_BUF_DEPTH, DAQ_BUF_NUM};
use rfcontrol_shared::registers::{
    self, BUF_ADDR_DAQ_START, BoardInfo, InterruptCounters, REG_FIRMWARE_NAME, REG_IRQ_DELAY_CNT,
    REG_PUL_CNT, REG_ROT_COEF_ACT, REG_ROT_COEF_FBK, REG_ROT_COEF_REF, REG_SWITCH_CTRL,
    ROT_COEF_FRACTION, SwitchControl,
};

use super::{AcquisitionAdapter, InterruptWait, IqWaveform, RegisterBus};
use crate::error::BackendError;
use crate::signal::ChannelFrame;

/// Highest logical channel wired straight to an ADC
const MAX_ADC_CHANNEL: usize = 9;

/// Internal waveforms exposed by the firmware, in refresh order
const INTERNAL_WAVEFORMS: [&str; 10] = [
    "dac_out",
    "ref",
    "fbk",
    "ref_rotated",
    "fbk_rotated",
    "tracked",
    "err",
    "err_acc",
    "act",
    "act_rotated",
];

/// Board-level settings for the IQ feedback firmware.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Sis8300Config {
    pub sample_freq_mhz: f64,
    pub daq_trigger_delay_ns: f64,

    /// Magnitude of the reference, feedback and actuation rotation coefficients
    pub ref_rotation_gain: f64,
    pub fbk_rotation_gain: f64,
    pub act_rotation_gain: f64,

    /// Even DAQ channel of each internal waveform, in the order
    /// DAC out, ref, fbk, ref rotated, fbk rotated, tracked, err, err acc, act, act rotated.
    /// `None` leaves that waveform unrouted.
    pub internal_channels: [Option<usize>; 10],
}

impl Default for Sis8300Config {
    fn default() -> Self {
        let mut internal_channels = [None; 10];
        internal_channels[0] = Some(10);
        internal_channels[6] = Some(12);
        internal_channels[8] = Some(14);
        Self {
            sample_freq_mhz: 102.0,
            daq_trigger_delay_ns: 0.0,
            ref_rotation_gain: 1.0,
            fbk_rotation_gain: 1.0,
            act_rotation_gain: 1.0,
            internal_channels,
        }
    }
}

/// Encode a rotation of `angle_deg` scaled by `gain` as a coefficient word.
pub(crate) fn rotation_word(gain: f64, angle_deg: f64) -> u32 {
    let full_scale = (1_u32 << ROT_COEF_FRACTION) as f64;
    let fixed = |v: f64| (v * full_scale).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    let rad = angle_deg.to_radians();
    registers::pack_rotation(fixed(gain * rad.cos()), fixed(gain * rad.sin()))
}

/// Acquisition adapter for the SIS8300 IQ feedback firmware.
pub struct Sis8300Iqfb {
    config: Sis8300Config,
    board: Option<Box<dyn RegisterBus>>,
    layout: PackedLayout,
    daq: Vec<u32>,
    internal: Vec<IqWaveform>,
    info: BoardInfo,

    ref_rotation_deg: f64,
    fbk_rotation_deg: f64,
    act_rotation_deg: f64,
}

impl Sis8300Iqfb {
    pub fn new(config: Sis8300Config) -> Self {
        let layout = PackedLayout::new(DAQ_BUF_NUM, DAQ_BUF_DEPTH);
        let internal = INTERNAL_WAVEFORMS
            .iter()
            .zip(config.internal_channels.iter())
            .map(|(name, ch)| IqWaveform::new(name, *ch, layout.depth))
            .collect();
        Self {
            config,
            board: None,
            layout,
            daq: vec![0; layout.num_words()],
            internal,
            info: BoardInfo::default(),
            ref_rotation_deg: 0.0,
            fbk_rotation_deg: 0.0,
            act_rotation_deg: 0.0,
        }
    }

    /// Identification read during `init`
    pub fn board_info(&self) -> BoardInfo {
        self.info
    }

    /// Current (reference, feedback, actuation) rotation angles
    pub fn rotations_deg(&self) -> (f64, f64, f64) {
        (
            self.ref_rotation_deg,
            self.fbk_rotation_deg,
            self.act_rotation_deg,
        )
    }

    fn board(&mut self) -> Result<&mut Box<dyn RegisterBus>, BackendError> {
        self.board.as_mut().ok_or(BackendError::NotAssociated)
    }

    fn write_rotations(&mut self) -> Result<(), BackendError> {
        let words = [
            (
                REG_ROT_COEF_REF,
                rotation_word(self.config.ref_rotation_gain, self.ref_rotation_deg),
            ),
            (
                REG_ROT_COEF_FBK,
                rotation_word(self.config.fbk_rotation_gain, self.fbk_rotation_deg),
            ),
            (
                REG_ROT_COEF_ACT,
                rotation_word(self.config.act_rotation_gain, self.act_rotation_deg),
            ),
        ];
        let board = self.board()?;
        for (addr, word) in words {
            board.write_register(addr, word)?;
        }
        Ok(())
    }
}

impl AcquisitionAdapter for Sis8300Iqfb {
    fn init(&mut self) -> Result<(), BackendError> {
        let mut words = [0_u32; BoardInfo::NUM_WORDS];
        self.board()?.read_block(REG_FIRMWARE_NAME, &mut words)?;
        self.info = BoardInfo::from_words(&words);

        if self.info.is_unavailable() {
            warn!("SIS8300 firmware identification reads all ones; board unavailable");
        } else {
            info!(
                "SIS8300 firmware {} v{}.{} build {}, serial {}",
                String::from_utf8_lossy(&self.info.firmware_tag()),
                self.info.major(),
                self.info.minor(),
                self.info.build(),
                self.info.serial_number
            );
        }

        self.ref_rotation_deg = 0.0;
        self.fbk_rotation_deg = 0.0;
        self.act_rotation_deg = 0.0;
        self.write_rotations()
    }

    fn associate(&mut self, board: Box<dyn RegisterBus>) -> Result<(), BackendError> {
        self.board = Some(board);
        Ok(())
    }

    fn max_sample_count(&self) -> usize {
        self.layout.depth
    }

    fn pull_daq_buffer(&mut self) -> Result<(), BackendError> {
        let board = self.board.as_mut().ok_or(BackendError::NotAssociated)?;
        board.read_block(BUF_ADDR_DAQ_START, &mut self.daq)?;
        if self.daq.iter().all(|w| registers::is_unavailable(*w)) {
            return Err(BackendError::HardwareUnavailable);
        }
        Ok(())
    }

    fn channel_samples(&self, channel: usize, out: &mut [i16]) -> Result<ChannelFrame, BackendError> {
        if channel > MAX_ADC_CHANNEL {
            return Err(rfcontrol_shared::UnpackError::InvalidChannel {
                channel,
                num_channels: MAX_ADC_CHANNEL + 1,
            }
            .into());
        }
        let point_count = self.layout.unpack_channel(&self.daq, channel, out)?;
        Ok(ChannelFrame {
            sample_rate_mhz: self.config.sample_freq_mhz,
            sample_delay_ns: self.config.daq_trigger_delay_ns,
            point_count,
            demod_coef_id: 0,
        })
    }

    fn refresh_internal_waveforms(&mut self) -> Result<(), BackendError> {
        let mut first_err = None;
        for wf in self.internal.iter_mut() {
            let Some(ch) = wf.channel_id else { continue };
            if let Err(e) = self
                .layout
                .unpack_pair(&self.daq, ch, &mut wf.wf_i, &mut wf.wf_q)
            {
                first_err.get_or_insert(BackendError::from(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn internal_waveforms(&self) -> &[IqWaveform] {
        &self.internal
    }

    fn apply_phase_adjustment(&mut self, delta_deg: f64) -> Result<(), BackendError> {
        self.ref_rotation_deg -= delta_deg;
        self.fbk_rotation_deg -= delta_deg;
        self.act_rotation_deg += delta_deg;
        self.write_rotations()
    }

    fn wait_for_interrupt(&mut self, timeout: Duration) -> InterruptWait {
        let board = match self.board() {
            Ok(b) => b,
            Err(e) => return InterruptWait::Failed(e),
        };
        match board.wait_interrupt(timeout) {
            Ok(true) => InterruptWait::Event,
            Ok(false) => InterruptWait::TimedOut,
            Err(e) => InterruptWait::Failed(e),
        }
    }

    fn measure_interrupt_latency(&mut self) -> Result<InterruptCounters, BackendError> {
        let board = self.board()?;
        board.write_register(REG_SWITCH_CTRL, SwitchControl::HoldCounters.into())?;
        let delay_count = board.read_register(REG_IRQ_DELAY_CNT)?;
        let pulse_count = board.read_register(REG_PUL_CNT)?;
        board.write_register(REG_SWITCH_CTRL, SwitchControl::RunCounters.into())?;
        Ok(InterruptCounters {
            delay_count,
            pulse_count,
        })
    }
}
