//! Pulse-to-pulse phase feedback with one-shot feed-forward on setpoint changes.
//!
//! Each pulse the controller forms an effective phase from the weighted
//! primary (SLED output) and secondary (accelerating structure) phases. When
//! the operator moves the setpoint or offset, the full step is applied once
//! as feed-forward; otherwise a proportional correction is applied while the
//! error is small and the primary amplitude is in range. A pulse never does both.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::PhaseActuator;
use crate::diagnostics::HistoryRing;
use crate::signal::normalize_phase_deg;

/// Previous-value sentinel. Outside (-180, 180], so the first pulse never
/// looks like a setpoint change.
const NO_PREVIOUS: f64 = 1e6;

/// Operator parameters of the phase loop.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FeedbackSettings {
    pub setpoint_deg: f64,
    pub gain: f64,
    /// Feedback holds off while |error| is at or above this
    pub threshold_deg: f64,
    /// Feedback holds off unless the primary amplitude is strictly between these
    pub amp_limit_lo: f64,
    pub amp_limit_hi: f64,
    pub weight_primary: f64,
    pub weight_secondary: f64,
    pub pha_offset_deg: f64,

    pub feedback_enabled: bool,
    pub feedforward_enabled: bool,
    /// Measure relative to the reference channel
    pub ref_tracking_enabled: bool,

    /// Primary amplitude units per MV, for the amplitude monitor
    pub amp_scale_per_mv: f64,
    pub amp_setpoint_mv: f64,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            setpoint_deg: 0.0,
            gain: 0.1,
            threshold_deg: 10.0,
            amp_limit_lo: 0.0,
            amp_limit_hi: 1e9,
            weight_primary: 1.0,
            weight_secondary: 0.0,
            pha_offset_deg: 0.0,
            feedback_enabled: false,
            feedforward_enabled: false,
            ref_tracking_enabled: false,
            amp_scale_per_mv: 1.0,
            amp_setpoint_mv: 0.0,
        }
    }
}

/// Per-pulse inputs to the phase loop.
///
/// A `*_stale` source failed to fetch or demodulate this pulse and carries
/// the previous pulse's values.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhaseMeasurement {
    pub primary_pha_deg: f64,
    pub primary_amp: f64,
    pub secondary_pha_deg: f64,
    pub reference_pha_deg: f64,
    pub primary_stale: bool,
    pub secondary_stale: bool,
    pub reference_stale: bool,
}

impl PhaseMeasurement {
    /// Whether every source contributing to the effective phase is fresh
    pub fn phase_usable(&self, settings: &FeedbackSettings) -> bool {
        !(settings.weight_primary != 0.0 && self.primary_stale)
            && !(settings.weight_secondary != 0.0 && self.secondary_stale)
            && !(settings.ref_tracking_enabled && self.reference_stale)
    }
}

/// What the controller did on a pulse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum FeedbackAction {
    #[default]
    Hold,
    FeedForward(f64),
    Feedback(f64),
}

/// Phase loop state carried between pulses.
#[derive(Clone, Debug)]
pub struct PhaseFeedbackController {
    prev_setpoint_deg: f64,
    prev_offset_deg: f64,

    pub effective_phase_deg: f64,
    pub error_deg: f64,
    /// Last adjustment applied; persists through pulses with no action
    pub adjustment_deg: f64,
    pub last_action: FeedbackAction,

    pub amp_mv: f64,
    pub amp_err_mv: f64,

    pub error_history: HistoryRing,

    /// Set while stale inputs hold the loop
    pub holding_stale: bool,

    actuation_failing: bool,
}

impl PhaseFeedbackController {
    pub fn new(history_depth: usize) -> Self {
        Self {
            prev_setpoint_deg: NO_PREVIOUS,
            prev_offset_deg: NO_PREVIOUS,
            effective_phase_deg: 0.0,
            error_deg: 0.0,
            adjustment_deg: 0.0,
            last_action: FeedbackAction::Hold,
            amp_mv: 0.0,
            amp_err_mv: 0.0,
            error_history: HistoryRing::new(history_depth),
            holding_stale: false,
            actuation_failing: false,
        }
    }

    /// Forget the previous setpoint so the next pulse cannot fire feed-forward.
    pub fn reset(&mut self) {
        self.prev_setpoint_deg = NO_PREVIOUS;
        self.prev_offset_deg = NO_PREVIOUS;
        self.last_action = FeedbackAction::Hold;
    }

    /// Weighted phase of the feedback sources, less offset and optionally reference.
    pub fn effective_phase(settings: &FeedbackSettings, meas: &PhaseMeasurement) -> f64 {
        let mut pha = settings.weight_primary * meas.primary_pha_deg
            + settings.weight_secondary * meas.secondary_pha_deg
            - settings.pha_offset_deg;
        if settings.ref_tracking_enabled {
            pha -= meas.reference_pha_deg;
        }
        normalize_phase_deg(pha)
    }

    fn changed(current: f64, previous: f64) -> bool {
        current != previous && previous.abs() <= 180.0
    }

    /// Evaluate one pulse and apply any correction through `actuator`.
    ///
    /// Stale inputs hold both corrections. A setpoint or offset change seen
    /// while holding fires feed-forward on the first fresh pulse.
    pub fn step<A: PhaseActuator + ?Sized>(
        &mut self,
        settings: &FeedbackSettings,
        meas: &PhaseMeasurement,
        actuator: &mut A,
    ) -> FeedbackAction {
        self.effective_phase_deg = Self::effective_phase(settings, meas);

        let phase_usable = meas.phase_usable(settings);
        if phase_usable == self.holding_stale {
            if phase_usable {
                debug!("Phase loop inputs fresh again");
            } else {
                warn!("Phase loop holding on stale measurement");
            }
            self.holding_stale = !phase_usable;
        }

        let edge = Self::changed(settings.setpoint_deg, self.prev_setpoint_deg)
            || Self::changed(settings.pha_offset_deg, self.prev_offset_deg);

        let mut action = FeedbackAction::Hold;
        let setpoint_for_error = if settings.feedforward_enabled && edge {
            if phase_usable {
                let adj = settings.setpoint_deg - self.effective_phase_deg;
                self.apply(actuator, adj);
                action = FeedbackAction::FeedForward(adj);
            }
            self.prev_setpoint_deg
        } else {
            settings.setpoint_deg
        };

        self.error_deg = if settings.weight_primary != 0.0 || settings.weight_secondary != 0.0 {
            normalize_phase_deg(setpoint_for_error - self.effective_phase_deg)
        } else {
            0.0
        };

        self.amp_mv = meas.primary_amp * settings.amp_scale_per_mv;
        self.amp_err_mv = settings.amp_setpoint_mv - self.amp_mv;

        let gate_open = self.error_deg.abs() < settings.threshold_deg
            && meas.primary_amp > settings.amp_limit_lo
            && meas.primary_amp < settings.amp_limit_hi
            && settings.feedback_enabled
            && phase_usable
            && !meas.primary_stale;
        if action == FeedbackAction::Hold && gate_open {
            let adj = self.error_deg * settings.gain;
            self.apply(actuator, adj);
            action = FeedbackAction::Feedback(adj);
        }

        self.error_history.push(self.error_deg);
        // Keep a pending edge for the next fresh pulse
        if phase_usable || !settings.feedforward_enabled {
            self.prev_setpoint_deg = settings.setpoint_deg;
            self.prev_offset_deg = settings.pha_offset_deg;
        }
        self.last_action = action;
        action
    }

    fn apply<A: PhaseActuator + ?Sized>(&mut self, actuator: &mut A, adj: f64) {
        self.adjustment_deg = adj;
        match actuator.apply_phase_adjustment(adj) {
            Ok(()) => self.actuation_failing = false,
            Err(e) => {
                if !self.actuation_failing {
                    warn!("Failed to apply phase adjustment of {adj:.3} deg: {e}");
                }
                self.actuation_failing = true;
            }
        }
    }
}
