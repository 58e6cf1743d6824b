//! Results the control thread publishes for outside readers.
//!
//! Each publication replaces a whole immutable record, so a reader always sees
//! the values of one pulse together.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::status::StatusBits;
use crate::feedback::FeedbackAction;
use crate::signal::RfChannel;

/// Thread-safe cell holding the latest snapshot of a `T`.
pub struct SnapshotCell<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    /// Replace the stored value with a new snapshot.
    pub fn store(&self, value: T) {
        self.store_arc(Arc::new(value));
    }

    pub fn store_arc(&self, value: Arc<T>) {
        match self.inner.write() {
            Ok(mut w) => *w = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Clone the latest snapshot handle.
    pub fn load(&self) -> Arc<T> {
        match self.inner.read() {
            Ok(r) => Arc::clone(&*r),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }
}

impl<T: Clone> SnapshotCell<T> {
    /// Store a modified copy of the current value.
    ///
    /// The write lock is held from read to store, so concurrent updates compose.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut w = match self.inner.write() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**w).clone();
        f(&mut next);
        *w = Arc::new(next);
    }
}

/// Windowed averages of one RF channel.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelSummary {
    pub avg_i: f64,
    pub avg_q: f64,
    pub avg_amp: f64,
    pub avg_pha_deg: f64,
    /// False when this pulse's samples could not be fetched or averaged
    pub valid: bool,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct FeedbackSummary {
    pub effective_phase_deg: f64,
    pub error_deg: f64,
    pub adjustment_deg: f64,
    pub action: FeedbackAction,
    pub amp_mv: f64,
    pub amp_err_mv: f64,
}

/// Per-pulse measurements, sent to slow consumers as soon as they are complete.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct PulseSummary {
    pub iteration: u64,
    /// RFC 3339 wall-clock time of the pulse
    pub system_time: String,
    /// Indexed by [`RfChannel::index`]
    pub rf: [ChannelSummary; 7],
    pub kly_beam_voltage: f64,
    pub feedback: FeedbackSummary,
}

impl PulseSummary {
    pub fn rf(&self, ch: RfChannel) -> &ChannelSummary {
        &self.rf[ch.index()]
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ProbeReading {
    pub selector: u32,
    pub label: &'static str,
    pub value: f64,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct InterruptStats {
    /// Interrupts handled since the thread started
    pub irq_count: u64,
    pub missed: u64,
    /// Bounded waits that elapsed without an interrupt
    pub timeouts: u64,
    pub delay_count: u32,
    /// Median of the last seven delay counts
    pub delay_filtered: i64,
    /// Last pulse count read, or -1 when unavailable
    pub pulse_count: i64,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct CaptureProgress {
    pub scalar_percent: u32,
    pub waveform_percent: u32,
    pub scalar_active: bool,
    pub waveform_active: bool,
}

/// History rings, oldest first.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct HistoryArrays {
    pub error_deg: Vec<f64>,
    pub probes: [Vec<f64>; 2],
}

/// Everything a station publishes, as of the end of one pulse.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct StationSnapshot {
    pub pulse: Arc<PulseSummary>,
    pub status: StatusBits,
    pub probes: [ProbeReading; 2],
    pub interrupts: InterruptStats,
    pub capture: CaptureProgress,
    /// Latest capture completion or failure message
    pub capture_status: String,
    /// Refreshed every few pulses, shared between snapshots in between
    pub history: Arc<HistoryArrays>,
}
