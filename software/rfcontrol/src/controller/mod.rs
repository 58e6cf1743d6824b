//! The per-pulse control loop of one station.
//!
//! Every pulse runs the same steps in the same order, whatever failed earlier
//! in the pulse:
//!
//! 1. wait for the pulse interrupt
//! 2. bulk DAQ transfer
//! 3. acquire and average the phase-control channels
//! 4. phase feedback / feed-forward
//! 5. acquire and average the remaining channels
//! 6. notify slow consumers
//! 7. scalar capture, then waveform capture
//! 8. one diagnostic task
//! 9. probe history
//! 10. status word
//! 11. interrupt latency and missed-pulse detection
//! 12. publish, then check for a stop request

use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::backend::{AcquisitionAdapter, InterruptWait};
use crate::capture::{
    AverageComponent, CaptureFrame, CaptureRegistry, SourceKey, SynchronizedCapture,
};
use crate::diagnostics::{
    ChannelQuantity, DiagnosticRoundRobin, DiagnosticTask, Probe, ProbeSource, ProbeTarget,
};
use crate::error::BackendError;
use crate::feedback::{FeedbackSettings, PhaseFeedbackController, PhaseMeasurement};
use crate::logging::open_station_log;
use crate::signal::{AnalogChannel, NonIqProcessor, RfChannel, SignalProcessor, WaveformChannel};

pub mod context;
mod interrupts;
mod publish;
mod settings;
mod station;
mod status;

pub use context::{ChannelMap, StationConfig};
pub use interrupts::InterruptMonitor;
pub use publish::{
    CaptureProgress, ChannelSummary, FeedbackSummary, HistoryArrays, InterruptStats,
    ProbeReading, PulseSummary, SnapshotCell, StationSnapshot,
};
pub use settings::Settings;
pub use station::{MAX_PRIORITY, Station, StationHandle, StationShared};
pub use status::StatusBits;

/// State of one station's control thread.
pub struct ControlLoop {
    name: String,
    config: StationConfig,
    backend: Box<dyn AcquisitionAdapter>,
    processor: Box<dyn SignalProcessor>,

    rf: Vec<WaveformChannel>,
    hv: AnalogChannel,

    feedback: PhaseFeedbackController,
    capture: SynchronizedCapture,
    diagnostics: DiagnosticRoundRobin,
    probes: [Probe; 2],
    interrupts: InterruptMonitor,

    shared: Arc<StationShared>,
    updates: (Sender<Arc<PulseSummary>>, Receiver<Arc<PulseSummary>>),

    iteration: u64,
    daq_unavailable: bool,
    hardware_unavailable: bool,
    status: StatusBits,
    history: Arc<HistoryArrays>,

    /// Sources currently reported as failing, so each fault is logged once
    faults: BTreeSet<String>,
    stalled: bool,
    applied_priority: Option<u8>,
}

impl ControlLoop {
    /// Build the loop around an initialized backend.
    pub fn new(
        config: StationConfig,
        backend: Box<dyn AcquisitionAdapter>,
        shared: Arc<StationShared>,
        updates: (Sender<Arc<PulseSummary>>, Receiver<Arc<PulseSummary>>),
    ) -> Self {
        let points = backend.max_sample_count();
        let rf = RfChannel::ALL
            .iter()
            .map(|&ch| WaveformChannel::new(ch.label(), config.channel_map.rf(ch), points))
            .collect();
        let hv = AnalogChannel::new("KLY HV", config.channel_map.kly_beam_voltage, points);
        let registry = CaptureRegistry::station(points.min(config.waveform_point_cap));
        let capture = SynchronizedCapture::new(
            registry,
            config.scalar_session_length,
            config.waveform_session_length,
        );
        let depth = config.history_depth;

        Self {
            name: config.name.clone(),
            backend,
            processor: Box::new(NonIqProcessor),
            rf,
            hv,
            feedback: PhaseFeedbackController::new(depth),
            capture,
            diagnostics: DiagnosticRoundRobin::station_tasks(),
            probes: [
                Probe::new(ProbeSource::PhaseError, depth),
                Probe::new(ProbeSource::PhaseError, depth),
            ],
            interrupts: InterruptMonitor::new(),
            shared,
            updates,
            iteration: 0,
            daq_unavailable: false,
            hardware_unavailable: false,
            status: StatusBits::default(),
            history: Arc::new(HistoryArrays::default()),
            faults: BTreeSet::new(),
            stalled: false,
            applied_priority: None,
            config,
        }
    }

    /// Swap the demodulation capability.
    pub fn with_processor(mut self, processor: Box<dyn SignalProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn feedback(&self) -> &PhaseFeedbackController {
        &self.feedback
    }

    pub fn capture(&self) -> &SynchronizedCapture {
        &self.capture
    }

    pub fn diagnostics(&self) -> &DiagnosticRoundRobin {
        &self.diagnostics
    }

    pub fn channel(&self, ch: RfChannel) -> &WaveformChannel {
        &self.rf[ch.index()]
    }

    pub fn analog(&self) -> &AnalogChannel {
        &self.hv
    }

    pub fn status(&self) -> StatusBits {
        self.status
    }

    pub fn interrupts(&self) -> InterruptStats {
        self.interrupts.stats()
    }

    pub fn into_backend(self) -> Box<dyn AcquisitionAdapter> {
        self.backend
    }

    /// Run until a stop is requested. Called on the station's own thread.
    pub fn run(&mut self) {
        self.prepare_thread();
        self.applied_priority = None;
        self.feedback.reset();
        info!(
            "Station {} control loop running on {}",
            self.name,
            self.backend.kind()
        );

        let timeout = self.config.interrupt_timeout();
        loop {
            self.apply_priority();
            if self.wait_for_pulse(timeout) {
                self.iterate();
            }
            if self.shared.stop.load(Ordering::Relaxed) {
                break;
            }
        }
        info!(
            "Station {} control loop stopped after {} pulses",
            self.name, self.iteration
        );
    }

    /// Wait for one pulse and, if it arrives, process it.
    pub fn run_once(&mut self) -> bool {
        let pulsed = self.wait_for_pulse(self.config.interrupt_timeout());
        if pulsed {
            self.iterate();
        }
        pulsed
    }

    /// Process one pulse whose interrupt has already arrived.
    pub fn iterate(&mut self) {
        self.iteration += 1;
        self.interrupts.record_interrupt();
        let settings = self.shared.settings.load();
        let system_time = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        for ch in RfChannel::ALL {
            self.rf[ch.index()].tuning = settings.tuning_for(ch);
        }
        self.hv.tuning = settings.kly_beam_voltage;

        self.pull_daq();

        for ch in RfChannel::PHASE_CONTROL {
            self.acquire_rf(ch);
        }

        let meas = PhaseMeasurement {
            primary_pha_deg: self.channel(RfChannel::SledOutput).avg_pha_deg,
            primary_amp: self.channel(RfChannel::SledOutput).avg_amp,
            secondary_pha_deg: self.channel(RfChannel::AccRf).avg_pha_deg,
            reference_pha_deg: self.channel(RfChannel::Reference).avg_pha_deg,
            primary_stale: !self.channel(RfChannel::SledOutput).valid,
            secondary_stale: !self.channel(RfChannel::AccRf).valid,
            reference_stale: !self.channel(RfChannel::Reference).valid,
        };
        self.feedback
            .step(&settings.feedback, &meas, self.backend.as_mut());

        for ch in RfChannel::MONITOR_ONLY {
            self.acquire_rf(ch);
        }
        self.acquire_analog();

        let pulse = Arc::new(self.pulse_summary(system_time));
        self.notify(Arc::clone(&pulse));

        let frame = LiveFrame {
            feedback: &self.feedback,
            rf: &self.rf,
            hv: &self.hv,
        };
        let trigger = self.shared.scalar_trigger.swap(false, Ordering::AcqRel);
        self.capture.step_scalar(trigger, &settings.capture, &frame);
        let trigger = self.shared.waveform_trigger.swap(false, Ordering::AcqRel);
        self.capture.step_waveform(trigger, &settings.capture, &frame);

        let (backend, processor, rf) = (&mut self.backend, &self.processor, &mut self.rf);
        self.diagnostics
            .step(|task| run_diagnostic(task, backend.as_mut(), processor.as_ref(), rf));

        for (probe, selector) in self.probes.iter_mut().zip(settings.probe_selectors) {
            probe.sample(selector, |target| {
                read_probe(target, &self.feedback, &self.rf, &self.hv)
            });
        }

        self.update_status(&settings.feedback);
        self.measure_latency();
        self.publish(pulse);
    }

    fn prepare_thread(&mut self) {
        if self.config.log_to_file {
            if let Err(e) = open_station_log(&self.config.op_dir, &self.name) {
                warn!("Station {} could not log to file: {e}", self.name);
            }
        }

        #[cfg(feature = "affinity")]
        if let Some(core) = self.config.core_affinity {
            let core_ids = core_affinity::get_core_ids().unwrap_or_default();
            match core_ids.into_iter().find(|c| c.id == core) {
                Some(id) if core_affinity::set_for_current(id) => {
                    info!("Station {} pinned to core {core}", self.name)
                }
                _ => warn!("Station {} could not be pinned to core {core}", self.name),
            }
        }

        #[cfg(not(feature = "affinity"))]
        if let Some(core) = self.config.core_affinity {
            warn!(
                "Station {} requested core {core} but CPU pinning is not enabled in this build",
                self.name
            );
        }
    }

    /// Apply a priority change requested since the last pulse.
    fn apply_priority(&mut self) {
        let wanted = self.shared.priority.load(Ordering::Relaxed);
        if self.applied_priority == Some(wanted) {
            return;
        }
        self.applied_priority = Some(wanted);
        match set_thread_priority(wanted) {
            Ok(()) => info!("Station {} thread priority set to {wanted}", self.name),
            Err(e) => warn!(
                "Station {} could not set thread priority {wanted}: {e}",
                self.name
            ),
        }
    }

    fn wait_for_pulse(&mut self, timeout: Duration) -> bool {
        match self.backend.wait_for_interrupt(timeout) {
            InterruptWait::Event => {
                if self.stalled {
                    info!("Station {} interrupts resumed", self.name);
                    self.stalled = false;
                }
                true
            }
            InterruptWait::TimedOut => {
                self.interrupts.record_timeout();
                if !self.stalled {
                    warn!("Station {} saw no interrupt within {timeout:?}", self.name);
                    self.stalled = true;
                }
                false
            }
            InterruptWait::Failed(e) => {
                if !self.stalled {
                    warn!("Station {} interrupt wait failed: {e}", self.name);
                    self.stalled = true;
                }
                thread::sleep(timeout);
                false
            }
        }
    }

    fn pull_daq(&mut self) {
        match self.backend.pull_daq_buffer() {
            Ok(()) => {
                self.daq_unavailable = false;
                clear_fault(&mut self.faults, &self.name, "DAQ buffer");
            }
            Err(e) => {
                self.daq_unavailable = e == BackendError::HardwareUnavailable;
                report_fault(&mut self.faults, &self.name, "DAQ buffer", &e);
            }
        }
    }

    fn acquire_rf(&mut self, ch: RfChannel) {
        let wf = &mut self.rf[ch.index()];
        let result = self
            .backend
            .channel_samples(wf.channel_id, &mut wf.raw)
            .map_err(|e| e.to_string())
            .and_then(|frame| {
                wf.frame = frame;
                self.processor
                    .demodulate_average(wf)
                    .map_err(|e| e.to_string())
            });
        wf.valid = result.is_ok();
        match result {
            Ok(()) => clear_fault(&mut self.faults, &self.name, &wf.name),
            Err(e) => report_fault(&mut self.faults, &self.name, &wf.name, &e),
        }
    }

    fn acquire_analog(&mut self) {
        let hv = &mut self.hv;
        let result = self
            .backend
            .channel_samples(hv.channel_id, &mut hv.raw)
            .map_err(|e| e.to_string())
            .and_then(|frame| {
                hv.frame = frame;
                self.processor.average_analog(hv).map_err(|e| e.to_string())
            });
        hv.valid = result.is_ok();
        match result {
            Ok(()) => clear_fault(&mut self.faults, &self.name, &hv.name),
            Err(e) => report_fault(&mut self.faults, &self.name, &hv.name, &e),
        }
    }

    fn pulse_summary(&self, system_time: String) -> PulseSummary {
        let mut rf = [ChannelSummary::default(); 7];
        for (summary, wf) in rf.iter_mut().zip(self.rf.iter()) {
            *summary = ChannelSummary {
                avg_i: wf.avg_i,
                avg_q: wf.avg_q,
                avg_amp: wf.avg_amp,
                avg_pha_deg: wf.avg_pha_deg,
                valid: wf.valid,
            };
        }
        let fb = &self.feedback;
        PulseSummary {
            iteration: self.iteration,
            system_time,
            rf,
            kly_beam_voltage: self.hv.avg,
            feedback: FeedbackSummary {
                effective_phase_deg: fb.effective_phase_deg,
                error_deg: fb.error_deg,
                adjustment_deg: fb.adjustment_deg,
                action: fb.last_action,
                amp_mv: fb.amp_mv,
                amp_err_mv: fb.amp_err_mv,
            },
        }
    }

    /// Queue this pulse for slow consumers, dropping the oldest entry when full.
    fn notify(&mut self, pulse: Arc<PulseSummary>) {
        let (tx, rx) = &self.updates;
        if tx.is_full() {
            let _ = rx.try_recv();
        }
        let _ = tx.try_send(pulse);
    }

    fn update_status(&mut self, settings: &FeedbackSettings) {
        let unavailable = self.daq_unavailable || self.interrupts.pulse_count_unavailable();
        if unavailable != self.hardware_unavailable {
            if unavailable {
                warn!("Station {} hardware unavailable", self.name);
            } else {
                info!("Station {} hardware available again", self.name);
            }
            self.hardware_unavailable = unavailable;
        }
        self.status = StatusBits::compute(
            unavailable,
            settings,
            self.feedback.error_deg,
            self.channel(RfChannel::SledOutput).avg_amp,
        );
    }

    fn measure_latency(&mut self) {
        match self.backend.measure_interrupt_latency() {
            Ok(counters) => {
                clear_fault(&mut self.faults, &self.name, "interrupt counters");
                if self.interrupts.observe(counters) {
                    debug!(
                        "Station {} missed interrupts before pulse {}",
                        self.name, counters.pulse_count
                    );
                }
            }
            Err(e) => {
                self.interrupts.observe_unavailable();
                report_fault(&mut self.faults, &self.name, "interrupt counters", &e);
            }
        }
    }

    fn publish(&mut self, pulse: Arc<PulseSummary>) {
        if self.iteration % self.config.history_publish_every.max(1) == 0 {
            self.history = Arc::new(HistoryArrays {
                error_deg: self.feedback.error_history.to_vec(),
                probes: [
                    self.probes[0].history.to_vec(),
                    self.probes[1].history.to_vec(),
                ],
            });
        }

        let reading = |p: &Probe| ProbeReading {
            selector: u32::from(p.source),
            label: p.label(),
            value: p.value,
        };
        let scalar = self.capture.scalar_session();
        let waveform = self.capture.waveform_session();
        self.shared.snapshot.store(StationSnapshot {
            pulse,
            status: self.status,
            probes: [reading(&self.probes[0]), reading(&self.probes[1])],
            interrupts: self.interrupts.stats(),
            capture: CaptureProgress {
                scalar_percent: scalar.percent(),
                waveform_percent: waveform.percent(),
                scalar_active: scalar.is_active(),
                waveform_active: waveform.is_active(),
            },
            capture_status: self.capture.status().to_owned(),
            history: Arc::clone(&self.history),
        });
    }
}

/// Live values seen by capture sources on the current pulse.
struct LiveFrame<'a> {
    feedback: &'a PhaseFeedbackController,
    rf: &'a [WaveformChannel],
    hv: &'a AnalogChannel,
}

impl CaptureFrame for LiveFrame<'_> {
    fn scalar(&self, key: SourceKey) -> f64 {
        match key {
            SourceKey::PhaseError => self.feedback.error_deg,
            SourceKey::PhaseAdjustment => self.feedback.adjustment_deg,
            SourceKey::RfAverage(ch, comp) => {
                let wf = &self.rf[ch.index()];
                match comp {
                    AverageComponent::I => wf.avg_i,
                    AverageComponent::Q => wf.avg_q,
                    AverageComponent::Amp => wf.avg_amp,
                    AverageComponent::Pha => wf.avg_pha_deg,
                }
            }
            SourceKey::AnalogAverage => self.hv.avg,
            SourceKey::RfRaw(_) | SourceKey::AnalogRaw => 0.0,
        }
    }

    fn waveform(&self, key: SourceKey) -> &[i16] {
        match key {
            SourceKey::RfRaw(ch) => self.rf[ch.index()].samples(),
            SourceKey::AnalogRaw => self.hv.samples(),
            _ => &[],
        }
    }
}

fn run_diagnostic(
    task: DiagnosticTask,
    backend: &mut dyn AcquisitionAdapter,
    processor: &dyn SignalProcessor,
    rf: &mut [WaveformChannel],
) {
    match task {
        DiagnosticTask::FetchInternalWaveforms => {
            if let Err(e) = backend.refresh_internal_waveforms() {
                debug!("Internal waveforms not refreshed: {e}");
            }
        }
        DiagnosticTask::AmplitudePhase(ch) => {
            let wf = &mut rf[ch.index()];
            if wf.valid {
                if let Err(e) = processor.amplitude_phase(wf) {
                    debug!("{} amplitude/phase not computed: {e}", wf.name);
                }
            }
        }
    }
}

fn read_probe(
    target: ProbeTarget,
    feedback: &PhaseFeedbackController,
    rf: &[WaveformChannel],
    hv: &AnalogChannel,
) -> Option<f64> {
    match target {
        ProbeTarget::PhaseError => Some(feedback.error_deg),
        ProbeTarget::PhaseAdjustment => Some(feedback.adjustment_deg),
        ProbeTarget::Rf(ch, ChannelQuantity::Amp) => Some(rf[ch.index()].avg_amp),
        ProbeTarget::Rf(ch, ChannelQuantity::Pha) => Some(rf[ch.index()].avg_pha_deg),
        ProbeTarget::KlyBeamVoltage => Some(hv.avg),
        ProbeTarget::None => None,
    }
}

fn report_fault(faults: &mut BTreeSet<String>, station: &str, source: &str, err: &impl Display) {
    if !faults.contains(source) {
        warn!("Station {station}: {source} stale: {err}");
        faults.insert(source.to_owned());
    }
}

fn clear_fault(faults: &mut BTreeSet<String>, station: &str, source: &str) {
    if faults.remove(source) {
        info!("Station {station}: {source} recovered");
    }
}

fn set_thread_priority(priority: u8) -> Result<(), String> {
    use thread_priority::{ThreadPriority, ThreadPriorityValue};

    let value = ThreadPriorityValue::try_from(priority).map_err(|e| e.to_string())?;
    thread_priority::set_current_thread_priority(ThreadPriority::Crossplatform(value))
        .map_err(|e| format!("{e:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBoard, SimulatedBoardHandle, Sis8300Config, Sis8300Iqfb};
    use crate::feedback::FeedbackAction;
    use approx::assert_abs_diff_eq;
    use crossbeam::channel::bounded;

    fn station(config: StationConfig) -> (ControlLoop, Arc<StationShared>, SimulatedBoardHandle) {
        let board = SimulatedBoard::new(Duration::ZERO);
        let handle = board.handle();
        let mut fw = Sis8300Iqfb::new(Sis8300Config::default());
        fw.associate(Box::new(board)).unwrap();
        fw.init().unwrap();

        let shared = Arc::new(StationShared::new(&config));
        let control = ControlLoop::new(config, Box::new(fw), shared.clone(), bounded(4));
        (control, shared, handle)
    }

    fn small_config(dir: &std::path::Path) -> StationConfig {
        let mut cfg = StationConfig::new("test");
        cfg.op_dir = dir.to_path_buf();
        cfg.history_depth = 16;
        cfg.scalar_session_length = 5;
        cfg.waveform_session_length = 2;
        cfg.waveform_point_cap = 8;
        cfg.history_publish_every = 1;
        cfg.capture.folder = dir.to_path_buf();
        cfg
    }

    #[test]
    fn averages_follow_simulated_tones() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _shared, _board) = station(small_config(dir.path()));
        assert!(control.run_once());

        let sled = control.channel(RfChannel::SledOutput);
        assert!(sled.valid);
        assert_abs_diff_eq!(sled.avg_amp, 10_000.0, epsilon = 2.0);
        assert_abs_diff_eq!(sled.avg_pha_deg, 25.0, epsilon = 0.1);
        assert!(control.analog().valid);
        assert_abs_diff_eq!(control.analog().avg, 2000.0, epsilon = 1e-9);
    }

    #[test]
    fn feedback_pulls_primary_phase_to_setpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, board) = station(small_config(dir.path()));
        shared.settings.update(|s| {
            s.feedback.feedback_enabled = true;
            s.feedback.gain = 0.5;
            s.feedback.setpoint_deg = 20.0;
        });
        board.set_drift_deg(3.0);

        for _ in 0..40 {
            control.run_once();
        }
        let sled = control.channel(RfChannel::SledOutput);
        assert_abs_diff_eq!(sled.avg_pha_deg, 20.0, epsilon = 0.2);
        assert!(control.status().is_set(StatusBits::FEEDBACK_ENABLED));
        assert!(!control.status().is_set(StatusBits::ERROR_OVER_THRESHOLD));
    }

    #[test]
    fn stale_primary_channel_freezes_actuation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, board) = station(small_config(dir.path()));
        shared.settings.update(|s| {
            s.feedback.feedback_enabled = true;
            s.feedback.gain = 0.5;
            s.feedback.setpoint_deg = 20.0;
        });
        control.run_once();
        control.run_once();

        // An averaging window too short to demodulate
        shared.settings.update(|s| {
            let tuning = s.tuning.entry(RfChannel::SledOutput).or_default();
            tuning.avg_start = 5;
            tuning.avg_end = 6;
        });
        control.run_once();
        assert!(!control.channel(RfChannel::SledOutput).valid);
        let frozen = board.actuation_deg();
        for _ in 0..20 {
            control.run_once();
        }
        assert_abs_diff_eq!(board.actuation_deg(), frozen, epsilon = 1e-9);
        assert_eq!(control.feedback().last_action, FeedbackAction::Hold);

        shared.settings.update(|s| {
            s.tuning.remove(&RfChannel::SledOutput);
        });
        for _ in 0..40 {
            control.run_once();
        }
        let sled = control.channel(RfChannel::SledOutput);
        assert!(sled.valid);
        assert_abs_diff_eq!(sled.avg_pha_deg, 20.0, epsilon = 0.2);
    }

    #[test]
    fn setpoint_step_fires_feedforward_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, _board) = station(small_config(dir.path()));
        shared.settings.update(|s| {
            s.feedback.feedforward_enabled = true;
            s.feedback.feedback_enabled = true;
            s.feedback.setpoint_deg = 25.0;
        });
        control.run_once();
        assert!(!matches!(
            control.feedback().last_action,
            FeedbackAction::FeedForward(_)
        ));

        shared.settings.update(|s| s.feedback.setpoint_deg = 35.0);
        control.run_once();
        match control.feedback().last_action {
            FeedbackAction::FeedForward(adj) => assert_abs_diff_eq!(adj, 10.0, epsilon = 0.2),
            other => panic!("expected feed-forward, got {other:?}"),
        }

        control.run_once();
        assert!(matches!(
            control.feedback().last_action,
            FeedbackAction::Feedback(_) | FeedbackAction::Hold
        ));
        assert_abs_diff_eq!(control.feedback().error_deg, 0.0, epsilon = 0.2);
    }

    #[test]
    fn scalar_capture_completes_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, _board) = station(small_config(dir.path()));
        shared.scalar_trigger.store(true, Ordering::Release);

        for _ in 0..5 {
            control.run_once();
        }
        assert!(!shared.scalar_trigger.load(Ordering::Acquire));
        let path = dir.path().join("scalar_capture.bin");
        assert_eq!(
            control.capture().status(),
            format!("{} saved!", path.display())
        );
        let sources = control.capture().scalar_names().len();
        assert_eq!(std::fs::read(&path).unwrap().len(), sources * 5 * 8);
        assert_eq!(shared.snapshot.load().capture.scalar_percent, 100);
    }

    #[test]
    fn waveform_capture_records_capped_points() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, _board) = station(small_config(dir.path()));
        shared.waveform_trigger.store(true, Ordering::Release);
        control.run_once();
        assert!(control.capture().waveform_session().is_active());
        control.run_once();

        let bytes = std::fs::read(dir.path().join("waveform_capture.bin")).unwrap();
        assert_eq!(bytes.len(), 8 * 2 * 8 * 2, "8 sources, 2 pulses, 8 points, 2 bytes");
        let reference = &control.capture().waveform_session().sources()[0];
        assert_eq!(reference.name, "ref_raw");
        assert_ne!(reference.recorded(2)[0], 0);
    }

    #[test]
    fn diagnostics_advance_one_task_per_pulse() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _shared, _board) = station(small_config(dir.path()));
        for k in 1..=3 {
            control.run_once();
            assert_eq!(control.diagnostics().cursor(), k);
        }
        let vm = control.channel(RfChannel::VmOutput);
        assert!(
            vm.wf_amp[..vm.point_count()].iter().any(|&a| a > 0.0),
            "third task computes vector modulator amplitude"
        );
    }

    #[test]
    fn skipped_pulses_count_as_missed_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, board) = station(small_config(dir.path()));
        for _ in 0..3 {
            control.run_once();
        }
        board.skip_pulses(2);
        control.run_once();
        control.run_once();

        assert_eq!(control.interrupts().missed, 1);
        assert_eq!(control.interrupts().irq_count, 5);
        assert_eq!(shared.snapshot.load().interrupts.missed, 1);
    }

    #[test]
    fn unavailable_hardware_sets_status_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _shared, board) = station(small_config(dir.path()));
        control.run_once();
        assert!(!control.status().is_set(StatusBits::HARDWARE_UNAVAILABLE));

        board.set_unavailable(true);
        control.run_once();
        assert!(control.status().is_set(StatusBits::HARDWARE_UNAVAILABLE));

        board.set_unavailable(false);
        control.run_once();
        control.run_once();
        assert!(!control.status().is_set(StatusBits::HARDWARE_UNAVAILABLE));
        assert!(control.channel(RfChannel::SledOutput).valid);
    }

    #[test]
    fn probes_and_history_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, shared, _board) = station(small_config(dir.path()));
        shared.settings.update(|s| s.probe_selectors = [11, 99]);
        for _ in 0..3 {
            control.run_once();
        }

        let snap = shared.snapshot.load();
        assert_eq!(snap.probes[0].label, "SLED OUT pha (deg)");
        assert_abs_diff_eq!(snap.probes[0].value, 25.0, epsilon = 0.1);
        assert_eq!(snap.probes[1].label, "Not supported");
        assert_eq!(snap.probes[1].value, 0.0);
        assert_eq!(snap.history.error_deg.len(), 16);
        assert_abs_diff_eq!(snap.history.probes[0][15], 25.0, epsilon = 0.1);
        assert_eq!(snap.pulse.iteration, 3);
    }

    #[test]
    fn slow_consumer_queue_keeps_newest_pulses() {
        let dir = tempfile::tempdir().unwrap();
        let (mut control, _shared, _board) = station(small_config(dir.path()));
        let rx = control.updates.1.clone();
        for _ in 0..10 {
            control.run_once();
        }
        let iterations: Vec<u64> = rx.try_iter().map(|p| p.iteration).collect();
        assert_eq!(iterations, vec![7, 8, 9, 10]);
    }
}
