use serde::Serialize;

use crate::feedback::FeedbackSettings;

/// Station status word, recomputed in full every pulse.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct StatusBits(pub u32);

impl StatusBits {
    pub const HARDWARE_UNAVAILABLE: u32 = 1 << 0;
    pub const FEEDBACK_ENABLED: u32 = 1 << 1;
    pub const FEEDFORWARD_ENABLED: u32 = 1 << 2;
    pub const REF_TRACKING_ENABLED: u32 = 1 << 3;
    pub const ERROR_OVER_THRESHOLD: u32 = 1 << 4;
    pub const AMP_AT_HIGH_LIMIT: u32 = 1 << 5;
    pub const AMP_AT_LOW_LIMIT: u32 = 1 << 6;
    pub const PRIMARY_WEIGHTED: u32 = 1 << 7;
    pub const SECONDARY_WEIGHTED: u32 = 1 << 8;

    /// `primary_amp` is the primary source's average amplitude.
    pub fn compute(
        hardware_unavailable: bool,
        settings: &FeedbackSettings,
        error_deg: f64,
        primary_amp: f64,
    ) -> Self {
        let flags = [
            (hardware_unavailable, Self::HARDWARE_UNAVAILABLE),
            (settings.feedback_enabled, Self::FEEDBACK_ENABLED),
            (settings.feedforward_enabled, Self::FEEDFORWARD_ENABLED),
            (settings.ref_tracking_enabled, Self::REF_TRACKING_ENABLED),
            (error_deg.abs() >= settings.threshold_deg, Self::ERROR_OVER_THRESHOLD),
            (primary_amp >= settings.amp_limit_hi, Self::AMP_AT_HIGH_LIMIT),
            (primary_amp <= settings.amp_limit_lo, Self::AMP_AT_LOW_LIMIT),
            (settings.weight_primary > 0.0, Self::PRIMARY_WEIGHTED),
            (settings.weight_secondary > 0.0, Self::SECONDARY_WEIGHTED),
        ];
        Self(
            flags
                .iter()
                .filter(|(on, _)| *on)
                .fold(0, |acc, (_, bit)| acc | bit),
        )
    }

    pub fn is_set(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}
