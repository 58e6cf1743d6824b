//! Low-priority per-pulse work and operator probes.
//!
//! Waveform-level diagnostics are too slow to run in full every pulse, so
//! they are spread over consecutive pulses by [`DiagnosticRoundRobin`].

mod history;
mod probe;

pub use history::HistoryRing;
pub use probe::{ChannelQuantity, Probe, ProbeSource, ProbeTarget};

use crate::signal::RfChannel;

/// One slice of diagnostic work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticTask {
    /// Refresh the firmware's internal I/Q waveforms
    FetchInternalWaveforms,
    /// Compute full amplitude and phase waveforms for one channel
    AmplitudePhase(RfChannel),
}

/// Runs exactly one task per call, cycling through a fixed list.
#[derive(Clone, Debug)]
pub struct DiagnosticRoundRobin {
    tasks: Vec<DiagnosticTask>,
    cursor: usize,
}

impl DiagnosticRoundRobin {
    pub fn new(tasks: Vec<DiagnosticTask>) -> Self {
        Self { tasks, cursor: 0 }
    }

    /// Internal waveforms first, then amplitude/phase for every RF channel
    pub fn station_tasks() -> Self {
        let mut tasks = vec![DiagnosticTask::FetchInternalWaveforms];
        tasks.extend(RfChannel::ALL.iter().map(|&ch| DiagnosticTask::AmplitudePhase(ch)));
        Self::new(tasks)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Index of the task the next step will run
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Run the task under the cursor and advance, wrapping at the end of the list.
    pub fn step(&mut self, run: impl FnOnce(DiagnosticTask)) -> Option<DiagnosticTask> {
        let task = *self.tasks.get(self.cursor)?;
        run(task);
        self.cursor = (self.cursor + 1) % self.tasks.len();
        Some(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_each_task_once_per_cycle_in_order() {
        let mut rr = DiagnosticRoundRobin::station_tasks();
        let k = rr.len();
        assert_eq!(k, 8);

        let mut ran = Vec::new();
        for _ in 0..k {
            rr.step(|t| ran.push(t));
        }
        assert_eq!(rr.cursor(), 0, "cursor wraps after a full cycle");
        assert_eq!(ran[0], DiagnosticTask::FetchInternalWaveforms);
        for (i, ch) in RfChannel::ALL.iter().enumerate() {
            assert_eq!(ran[i + 1], DiagnosticTask::AmplitudePhase(*ch));
        }
    }

    #[test]
    fn cursor_stays_in_range() {
        let mut rr = DiagnosticRoundRobin::station_tasks();
        for _ in 0..50 {
            rr.step(|_| {});
            assert!(rr.cursor() < rr.len());
        }
        assert_eq!(rr.cursor(), 50 % 8);
    }

    #[test]
    fn empty_list_runs_nothing() {
        let mut rr = DiagnosticRoundRobin::new(Vec::new());
        let mut called = false;
        assert_eq!(rr.step(|_| called = true), None);
        assert!(!called);
    }
}
