use crate::error::SignalError;

use super::{AnalogChannel, WaveformChannel, normalize_phase_deg};

/// Demodulation, averaging and amplitude/phase conversion of channel samples.
///
/// The station only depends on this interface; swap in a different
/// implementation to match the board's sampling scheme.
pub trait SignalProcessor: Send {
    /// Fill `avg_i`, `avg_q`, `avg_amp` and `avg_pha_deg` from the samples in the averaging window.
    fn demodulate_average(&self, ch: &mut WaveformChannel) -> Result<(), SignalError>;

    /// Fill the full I/Q, amplitude and phase waveforms.
    fn amplitude_phase(&self, ch: &mut WaveformChannel) -> Result<(), SignalError>;

    /// Scale raw samples to physical units and average over the window.
    fn average_analog(&self, ch: &mut AnalogChannel) -> Result<(), SignalError>;
}

/// Non-IQ demodulation with four samples per RF period.
///
/// Within each group of four consecutive samples `x0..x3`,
/// `I = (x0 - x2) / 2` and `Q = (x3 - x1) / 2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonIqProcessor;

impl NonIqProcessor {
    const PERIOD: usize = 4;

    fn group_iq(x: &[i16]) -> (f64, f64) {
        let i = (x[0] as f64 - x[2] as f64) / 2.0;
        let q = (x[3] as f64 - x[1] as f64) / 2.0;
        (i, q)
    }
}

impl SignalProcessor for NonIqProcessor {
    fn demodulate_average(&self, ch: &mut WaveformChannel) -> Result<(), SignalError> {
        let (start, end) = ch.window();
        let first = start.div_ceil(Self::PERIOD) * Self::PERIOD;

        let (mut sum_i, mut sum_q, mut n) = (0.0, 0.0, 0_usize);
        let mut k = first;
        while k + Self::PERIOD <= end {
            let (i, q) = Self::group_iq(&ch.raw[k..k + Self::PERIOD]);
            sum_i += i;
            sum_q += q;
            n += 1;
            k += Self::PERIOD;
        }
        if n == 0 {
            return Err(SignalError::EmptyWindow { start, end });
        }

        ch.avg_i = sum_i / n as f64;
        ch.avg_q = sum_q / n as f64;
        ch.avg_amp = ch.tuning.amp_scale * ch.avg_i.hypot(ch.avg_q);
        ch.avg_pha_deg =
            normalize_phase_deg(ch.avg_q.atan2(ch.avg_i).to_degrees() + ch.tuning.pha_offset_deg);
        Ok(())
    }

    fn amplitude_phase(&self, ch: &mut WaveformChannel) -> Result<(), SignalError> {
        let n = ch.point_count();
        if n < Self::PERIOD {
            return Err(SignalError::ShortWaveform(n));
        }

        let (scale, offset) = (ch.tuning.amp_scale, ch.tuning.pha_offset_deg);
        let (mut i, mut q) = (0.0, 0.0);
        for k in 0..n {
            // Recompute at each group boundary; the tail reuses the last full group
            if k % Self::PERIOD == 0 && k + Self::PERIOD <= n {
                (i, q) = Self::group_iq(&ch.raw[k..k + Self::PERIOD]);
            }
            ch.wf_i[k] = i;
            ch.wf_q[k] = q;
            ch.wf_amp[k] = scale * i.hypot(q);
            ch.wf_pha_deg[k] = normalize_phase_deg(q.atan2(i).to_degrees() + offset);
        }
        Ok(())
    }

    fn average_analog(&self, ch: &mut AnalogChannel) -> Result<(), SignalError> {
        let n = ch.point_count();
        let scale = ch.tuning.amp_scale;
        for k in 0..n {
            ch.values[k] = ch.raw[k] as f64 * scale;
        }

        let (start, end) = ch.window();
        if start == end {
            return Err(SignalError::EmptyWindow { start, end });
        }
        ch.avg = ch.values[start..end].iter().sum::<f64>() / (end - start) as f64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Four samples per period of amp * cos(k * 90 deg + pha)
    fn sampled(amp: f64, pha_deg: f64, n: usize) -> Vec<i16> {
        (0..n)
            .map(|k| {
                let theta = (k as f64) * std::f64::consts::FRAC_PI_2 + pha_deg.to_radians();
                (amp * theta.cos()).round() as i16
            })
            .collect()
    }

    fn channel_with(samples: &[i16]) -> WaveformChannel {
        let mut ch = WaveformChannel::new("test", 0, samples.len());
        ch.raw.copy_from_slice(samples);
        ch.frame.point_count = samples.len();
        ch
    }

    #[test]
    fn recovers_amplitude_and_phase_of_sampled_tone() {
        let mut ch = channel_with(&sampled(10_000.0, 35.0, 64));
        ch.tuning.amp_scale = 0.001;
        NonIqProcessor.demodulate_average(&mut ch).unwrap();

        assert_abs_diff_eq!(ch.avg_amp, 10.0, epsilon = 1e-3);
        assert_abs_diff_eq!(ch.avg_pha_deg, 35.0, epsilon = 0.01);
    }

    #[test]
    fn phase_offset_is_applied_and_wrapped() {
        let mut ch = channel_with(&sampled(8_000.0, 170.0, 32));
        ch.tuning.pha_offset_deg = 20.0;
        NonIqProcessor.demodulate_average(&mut ch).unwrap();
        assert_abs_diff_eq!(ch.avg_pha_deg, -170.0, epsilon = 0.01);
    }

    #[test]
    fn window_without_full_period_is_an_error() {
        let mut ch = channel_with(&sampled(1_000.0, 0.0, 32));
        ch.tuning.avg_start = 5;
        ch.tuning.avg_end = 10;
        assert_eq!(
            NonIqProcessor.demodulate_average(&mut ch),
            Err(SignalError::EmptyWindow { start: 5, end: 10 })
        );
    }

    #[test]
    fn fills_waveforms_including_tail() {
        let mut ch = channel_with(&sampled(4_000.0, -60.0, 30));
        NonIqProcessor.amplitude_phase(&mut ch).unwrap();
        for k in 0..30 {
            assert_abs_diff_eq!(ch.wf_amp[k], 4_000.0, epsilon = 1.0);
            assert_abs_diff_eq!(ch.wf_pha_deg[k], -60.0, epsilon = 0.05);
        }
    }

    #[test]
    fn averages_analog_window_in_physical_units() {
        let mut ch = AnalogChannel::new("hv", 9, 8);
        ch.raw.copy_from_slice(&[0, 0, 100, 200, 300, 400, 0, 0]);
        ch.frame.point_count = 8;
        ch.tuning.amp_scale = 0.5;
        ch.tuning.avg_start = 2;
        ch.tuning.avg_end = 6;
        NonIqProcessor.average_analog(&mut ch).unwrap();
        assert_abs_diff_eq!(ch.avg, 125.0);
        assert_abs_diff_eq!(ch.values[5], 200.0);
    }
}
