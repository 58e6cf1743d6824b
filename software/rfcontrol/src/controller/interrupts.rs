//! Pulse interrupt bookkeeping.

use flaw::MedianFilter;
use rfcontrol_shared::registers::InterruptCounters;

use super::publish::InterruptStats;

/// Counts interrupts and infers missed ones from the board's pulse counter.
pub struct InterruptMonitor {
    stats: InterruptStats,
    prev_pulse_count: i64,
    unavailable: bool,
    delay_filter: MedianFilter<i64, 7>,
}

impl Default for InterruptMonitor {
    fn default() -> Self {
        Self {
            stats: InterruptStats {
                pulse_count: -1,
                ..Default::default()
            },
            prev_pulse_count: -1,
            unavailable: false,
            delay_filter: MedianFilter::<i64, 7>::new(0),
        }
    }
}

impl InterruptMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> InterruptStats {
        self.stats
    }

    pub fn record_interrupt(&mut self) {
        self.stats.irq_count += 1;
    }

    pub fn record_timeout(&mut self) {
        self.stats.timeouts += 1;
    }

    /// Take this pulse's counters. Returns true if pulses were skipped since the last reading.
    ///
    /// The first valid reading after an unavailable one never counts as a miss.
    pub fn observe(&mut self, counters: InterruptCounters) -> bool {
        let pulse = counters.pulse_count_signed();
        let missed = pulse - self.prev_pulse_count > 1 && self.prev_pulse_count > 0;
        if missed {
            self.stats.missed += 1;
        }
        self.prev_pulse_count = pulse;
        self.unavailable = pulse < 0;
        self.stats.pulse_count = pulse;
        self.stats.delay_count = counters.delay_count;
        self.stats.delay_filtered = self.delay_filter.update(counters.delay_count as i64);
        missed
    }

    /// The counters could not be read this pulse.
    pub fn observe_unavailable(&mut self) {
        self.prev_pulse_count = -1;
        self.unavailable = true;
        self.stats.pulse_count = -1;
    }

    /// The last counter reading was the all-ones sentinel or failed
    pub fn pulse_count_unavailable(&self) -> bool {
        self.unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfcontrol_shared::registers::ALL_ONES;

    fn counters(pulse_count: u32) -> InterruptCounters {
        InterruptCounters {
            delay_count: 100,
            pulse_count,
        }
    }

    #[test]
    fn consecutive_pulses_are_not_missed() {
        let mut mon = InterruptMonitor::new();
        assert!(!mon.pulse_count_unavailable());
        for p in 1..=10 {
            assert!(!mon.observe(counters(p)));
        }
        assert_eq!(mon.stats().missed, 0);
        assert_eq!(mon.stats().pulse_count, 10);
    }

    #[test]
    fn first_reading_is_never_a_miss() {
        let mut mon = InterruptMonitor::new();
        assert!(!mon.observe(counters(5000)));
        assert_eq!(mon.stats().missed, 0);
    }

    #[test]
    fn gap_counts_once() {
        let mut mon = InterruptMonitor::new();
        mon.observe(counters(10));
        assert!(mon.observe(counters(13)));
        assert!(!mon.observe(counters(14)));
        assert_eq!(mon.stats().missed, 1);
    }

    #[test]
    fn zero_previous_count_does_not_arm_detection() {
        let mut mon = InterruptMonitor::new();
        mon.observe(counters(0));
        assert!(!mon.observe(counters(3)), "previous count must be positive");
    }

    #[test]
    fn sentinel_resets_detection() {
        let mut mon = InterruptMonitor::new();
        mon.observe(counters(10));
        mon.observe(counters(ALL_ONES));
        assert!(mon.pulse_count_unavailable());
        assert!(!mon.observe(counters(20)));

        mon.observe_unavailable();
        assert!(!mon.observe(counters(40)));
        assert_eq!(mon.stats().missed, 0);
    }

    #[test]
    fn delay_is_median_filtered() {
        let mut mon = InterruptMonitor::new();
        for (p, delay) in [150, 150, 150, 9000, 150, 150, 150].into_iter().enumerate() {
            mon.observe(InterruptCounters {
                delay_count: delay,
                pulse_count: p as u32 + 1,
            });
        }
        assert_eq!(mon.stats().delay_filtered, 150);
        assert_eq!(mon.stats().delay_count, 150);
    }
}
