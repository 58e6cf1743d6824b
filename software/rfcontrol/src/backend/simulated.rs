//! Software stand-in for a digitizer board, for running a station without hardware.
//!
//! The board answers the same registers as the IQ feedback firmware. Each pulse
//! it synthesizes non-IQ sampled tones whose phase follows the programmed
//! actuation rotation plus an adjustable drift, so a station closing the loop
//! through it behaves like one driving a real klystron.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rfcontrol_shared::PackedLayout;
use rfcontrol_shared::daq::pack_halves;
use rfcontrol_shared::registers::{
    ALL_ONES, BUF_ADDR_DAQ_START, InterruptCounters, REG_FIRMWARE_NAME, REG_FIRMWARE_VERSION,
    REG_IRQ_DELAY_CNT, REG_MODULE_SERIAL_NO, REG_PUL_CNT, REG_ROT_COEF_ACT, REG_SWITCH_CTRL,
    SwitchControl,
};

use super::RegisterBus;
use crate::error::BackendError;

/// Number of ADC inputs synthesized; higher channels carry the actuation I/Q
const NUM_ADC: usize = 10;

/// Amplitude of the synthesized internal actuation I/Q
const ACT_IQ_AMP: f64 = 8000.0;

/// One synthesized ADC input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tone {
    pub amp: f64,
    pub pha_deg: f64,
    /// Constant level added to every sample
    pub dc: f64,
    /// Whether the actuation rotation and drift shift this input's phase
    pub follows_actuation: bool,
}

impl Tone {
    pub const fn rf(amp: f64, pha_deg: f64, follows_actuation: bool) -> Self {
        Self {
            amp,
            pha_deg,
            dc: 0.0,
            follows_actuation,
        }
    }

    pub const fn level(dc: f64) -> Self {
        Self {
            amp: 0.0,
            pha_deg: 0.0,
            dc,
            follows_actuation: false,
        }
    }

    const fn off() -> Self {
        Self::level(0.0)
    }
}

#[derive(Debug)]
struct SimState {
    layout: PackedLayout,
    tones: [Tone; NUM_ADC],
    drift_deg: f64,
    act_deg: f64,

    regs: BTreeMap<u32, u32>,
    pulse_count: u32,
    pending_skip: u32,
    delay_count: u32,
    held: Option<InterruptCounters>,

    period: Duration,
    next_due: Option<Instant>,
    unavailable: bool,
    paused: bool,
}

impl SimState {
    fn new(period: Duration) -> Self {
        // Matches the default station channel map: REF on 0, RF monitors on 1..=6, HV on 9
        let tones = [
            Tone::rf(12_000.0, 0.0, false),
            Tone::rf(9_000.0, -20.0, true),
            Tone::rf(9_500.0, 15.0, true),
            Tone::rf(10_000.0, 40.0, true),
            Tone::rf(10_000.0, 25.0, true),
            Tone::rf(7_000.0, 30.0, true),
            Tone::rf(6_000.0, 120.0, true),
            Tone::off(),
            Tone::off(),
            Tone::level(2_000.0),
        ];
        Self {
            layout: PackedLayout::default(),
            tones,
            drift_deg: 0.0,
            act_deg: 0.0,
            regs: BTreeMap::new(),
            pulse_count: 0,
            pending_skip: 0,
            delay_count: 150,
            held: None,
            period,
            next_due: None,
            unavailable: false,
            paused: false,
        }
    }

    fn counters(&self) -> InterruptCounters {
        InterruptCounters {
            delay_count: self.delay_count + self.pulse_count % 7,
            pulse_count: self.pulse_count,
        }
    }

    fn sample(&self, channel: usize, k: usize) -> i16 {
        let v = if channel < NUM_ADC {
            let tone = &self.tones[channel];
            let mut pha = tone.pha_deg;
            if tone.follows_actuation {
                pha += self.act_deg + self.drift_deg;
            }
            let theta = k as f64 * std::f64::consts::FRAC_PI_2 + pha.to_radians();
            tone.dc + tone.amp * theta.cos()
        } else if channel % 2 == 0 {
            ACT_IQ_AMP * self.act_deg.to_radians().cos()
        } else {
            ACT_IQ_AMP * self.act_deg.to_radians().sin()
        };
        v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }

    fn read(&self, addr: u32) -> u32 {
        if self.unavailable {
            return ALL_ONES;
        }
        let counters = self.held.unwrap_or_else(|| self.counters());
        match addr {
            REG_FIRMWARE_NAME => u32::from_be_bytes(*b"SIMB"),
            REG_FIRMWARE_VERSION => 0x0100_0001,
            REG_MODULE_SERIAL_NO => 1,
            REG_IRQ_DELAY_CNT => counters.delay_count,
            REG_PUL_CNT => counters.pulse_count,
            _ => self.regs.get(&addr).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, addr: u32, value: u32) {
        self.regs.insert(addr, value);
        match addr {
            REG_SWITCH_CTRL => match SwitchControl::from(value) {
                SwitchControl::HoldCounters => self.held = Some(self.counters()),
                SwitchControl::RunCounters => self.held = None,
                SwitchControl::Unknown(_) => {}
            },
            REG_ROT_COEF_ACT => {
                let cos = (value >> 16) as u16 as i16 as f64;
                let sin = value as u16 as i16 as f64;
                self.act_deg = sin.atan2(cos).to_degrees();
            }
            _ => {}
        }
    }

    fn fill_daq(&self, out: &mut [u32]) {
        if self.unavailable {
            out.fill(ALL_ONES);
            return;
        }
        let depth = self.layout.depth;
        for (i, w) in out.iter_mut().enumerate() {
            let (buffer, k) = (i / depth, i % depth);
            *w = pack_halves(self.sample(2 * buffer, k), self.sample(2 * buffer + 1, k));
        }
    }
}

/// Register bus answered by a software model of the board.
#[derive(Debug)]
pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    /// Board producing one pulse interrupt every `period`.
    /// A zero period fires an interrupt on every wait.
    pub fn new(period: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(period))),
        }
    }

    /// Handle for steering the model from outside the control thread
    pub fn handle(&self) -> SimulatedBoardHandle {
        SimulatedBoardHandle {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Bus("simulated board state poisoned".to_string()))
    }
}

impl RegisterBus for SimulatedBoard {
    fn read_register(&mut self, addr: u32) -> Result<u32, BackendError> {
        Ok(self.lock()?.read(addr))
    }

    fn write_register(&mut self, addr: u32, value: u32) -> Result<(), BackendError> {
        self.lock()?.write(addr, value);
        Ok(())
    }

    fn read_block(&mut self, addr: u32, out: &mut [u32]) -> Result<(), BackendError> {
        let state = self.lock()?;
        if addr == BUF_ADDR_DAQ_START && out.len() <= state.layout.num_words() {
            state.fill_daq(out);
        } else {
            for (i, w) in out.iter_mut().enumerate() {
                *w = state.read(addr + i as u32);
            }
        }
        Ok(())
    }

    fn wait_interrupt(&mut self, timeout: Duration) -> Result<bool, BackendError> {
        // (sleep, fires)
        let (sleep, fires) = {
            let mut state = self.lock()?;
            if state.paused {
                (timeout, false)
            } else if state.period.is_zero() {
                (Duration::ZERO, true)
            } else {
                let now = Instant::now();
                let due = state.next_due.unwrap_or(now);
                let wait = due.saturating_duration_since(now);
                if wait > timeout {
                    (timeout, false)
                } else {
                    state.next_due = Some(due.max(now) + state.period);
                    (wait, true)
                }
            }
        };

        if !sleep.is_zero() {
            thread::sleep(sleep);
        }
        if !fires {
            return Ok(false);
        }

        let mut state = self.lock()?;
        state.pulse_count = state
            .pulse_count
            .wrapping_add(1)
            .wrapping_add(state.pending_skip);
        state.pending_skip = 0;
        Ok(true)
    }
}

/// Shared control over a [`SimulatedBoard`] that has been handed to a station.
#[derive(Clone, Debug)]
pub struct SimulatedBoardHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBoardHandle {
    fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    /// Phase disturbance added to every actuated input
    pub fn set_drift_deg(&self, drift_deg: f64) {
        self.with(|s| s.drift_deg = drift_deg);
    }

    /// Actuation rotation last programmed by the firmware adapter
    pub fn actuation_deg(&self) -> f64 {
        self.with(|s| s.act_deg).unwrap_or(f64::NAN)
    }

    pub fn pulse_count(&self) -> u32 {
        self.with(|s| s.pulse_count).unwrap_or(ALL_ONES)
    }

    /// Drop the next `n` pulses as if their interrupts had been missed.
    pub fn skip_pulses(&self, n: u32) {
        self.with(|s| s.pending_skip += n);
    }

    /// Make every read return the all-ones sentinel.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with(|s| s.unavailable = unavailable);
    }

    /// Stop delivering interrupts.
    pub fn set_paused(&self, paused: bool) {
        self.with(|s| s.paused = paused);
    }

    pub fn set_tone(&self, channel: usize, tone: Tone) {
        self.with(|s| {
            if let Some(t) = s.tones.get_mut(channel) {
                *t = tone;
            }
        });
    }
}
