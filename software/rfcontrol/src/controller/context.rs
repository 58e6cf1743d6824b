//! Setup-time configuration of a station.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureDestination;
use crate::error::ConfigurationError;
use crate::signal::RfChannel;

/// Logical DAQ channel carrying each monitored signal.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ChannelMap {
    pub reference: usize,
    pub vm_output: usize,
    pub kly_drive: usize,
    pub kly_output: usize,
    pub sled_output: usize,
    pub acc_rf: usize,
    pub acc_beam: usize,
    pub kly_beam_voltage: usize,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            reference: 0,
            vm_output: 1,
            kly_drive: 2,
            kly_output: 3,
            sled_output: 4,
            acc_rf: 5,
            acc_beam: 6,
            kly_beam_voltage: 9,
        }
    }
}

impl ChannelMap {
    pub fn rf(&self, ch: RfChannel) -> usize {
        match ch {
            RfChannel::Reference => self.reference,
            RfChannel::VmOutput => self.vm_output,
            RfChannel::KlystronDrive => self.kly_drive,
            RfChannel::KlystronOutput => self.kly_output,
            RfChannel::SledOutput => self.sled_output,
            RfChannel::AccRf => self.acc_rf,
            RfChannel::AccBeam => self.acc_beam,
        }
    }
}

/// Configuration fixed when a station is created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
#[non_exhaustive]
pub struct StationConfig {
    /// Station name, also used for the control thread and log file
    pub name: String,

    /// A directory for logs and other outputs
    pub op_dir: PathBuf,

    /// Also write logs to `{op_dir}/logs/{name}.log`
    pub log_to_file: bool,

    /// Control thread priority, 0..=99
    pub thread_priority: u8,

    /// Pin the control thread to this core, when built with `affinity`
    pub core_affinity: Option<usize>,

    /// Number of pulses kept by each history ring
    pub history_depth: usize,

    pub scalar_session_length: usize,
    pub waveform_session_length: usize,

    /// Most samples recorded per waveform capture source per pulse
    pub waveform_point_cap: usize,

    /// Longest single wait for the pulse interrupt before checking for a stop request
    pub interrupt_timeout_ms: u64,

    /// Pulses between publications of the history arrays
    pub history_publish_every: u64,

    pub channel_map: ChannelMap,

    /// Initial capture destination
    pub capture: CaptureDestination,
}

impl Default for StationConfig {
    fn default() -> Self {
        // Timestamped op dir under the working directory, without characters
        // that would be invalid on Windows
        let stamp = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            name: String::new(),
            op_dir: PathBuf::from(format!("./rfcontrol_{stamp}")),
            log_to_file: false,
            thread_priority: 50,
            core_affinity: None,
            history_depth: 2048,
            scalar_session_length: 65536,
            waveform_session_length: 2048,
            waveform_point_cap: 1024,
            interrupt_timeout_ms: 100,
            history_publish_every: 10,
            channel_map: ChannelMap::default(),
            capture: CaptureDestination::default(),
        }
    }
}

impl StationConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms.max(1))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigurationError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigurationError> {
        let text =
            serde_json::to_string_pretty(self).map_err(|source| ConfigurationError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        std::fs::write(path, text).map_err(|source| ConfigurationError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })
    }
}
