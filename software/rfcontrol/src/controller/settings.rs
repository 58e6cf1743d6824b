//! Operator-writable parameters, read by the control thread once per pulse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureDestination;
use crate::feedback::FeedbackSettings;
use crate::signal::{ChannelTuning, RfChannel};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub feedback: FeedbackSettings,

    /// Calibration and averaging window per RF channel; absent channels use defaults
    pub tuning: BTreeMap<RfChannel, ChannelTuning>,
    pub kly_beam_voltage: ChannelTuning,

    /// Selectors of the two independent probes
    pub probe_selectors: [u32; 2],

    pub capture: CaptureDestination,
}

impl Settings {
    pub fn tuning_for(&self, ch: RfChannel) -> ChannelTuning {
        self.tuning.get(&ch).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_is_keyed_by_channel_name() {
        let json = r#"{
            "feedback": {"setpoint_deg": 30.0, "feedback_enabled": true},
            "tuning": {"sled_output": {"avg_start": 100, "avg_end": 300}},
            "probe_selectors": [0, 16]
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.feedback.setpoint_deg, 30.0);
        assert!(settings.feedback.feedback_enabled);
        assert_eq!(settings.feedback.gain, FeedbackSettings::default().gain);
        assert_eq!(settings.tuning_for(RfChannel::SledOutput).avg_start, 100);
        assert_eq!(settings.tuning_for(RfChannel::AccRf), ChannelTuning::default());
        assert_eq!(settings.probe_selectors, [0, 16]);
    }
}
