//! A station's control thread and the handles used to talk to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, bounded};
use tracing::{error, info};

use super::{ControlLoop, PulseSummary, Settings, SnapshotCell, StationConfig, StationSnapshot};
use crate::backend::AcquisitionAdapter;
use crate::error::ConfigurationError;
use crate::logging;

/// Pulses buffered for slow consumers before the oldest is dropped
const UPDATE_QUEUE_DEPTH: usize = 10;

/// Highest accepted thread priority
pub const MAX_PRIORITY: u8 = 99;

/// State shared between a station's control thread and everything outside it.
pub struct StationShared {
    pub settings: SnapshotCell<Settings>,
    pub snapshot: SnapshotCell<StationSnapshot>,
    pub scalar_trigger: AtomicBool,
    pub waveform_trigger: AtomicBool,
    pub stop: AtomicBool,
    pub priority: AtomicU8,
}

impl StationShared {
    pub fn new(config: &StationConfig) -> Self {
        let settings = Settings {
            capture: config.capture.clone(),
            ..Default::default()
        };
        Self {
            settings: SnapshotCell::new(settings),
            snapshot: SnapshotCell::default(),
            scalar_trigger: AtomicBool::new(false),
            waveform_trigger: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            priority: AtomicU8::new(config.thread_priority.min(MAX_PRIORITY)),
        }
    }
}

/// Cloneable access to a station's published values and operator inputs.
#[derive(Clone)]
pub struct StationHandle {
    name: String,
    shared: Arc<StationShared>,
    updates: Receiver<Arc<PulseSummary>>,
}

impl StationHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings the control thread will use from its next pulse
    pub fn settings(&self) -> Arc<Settings> {
        self.shared.settings.load()
    }

    pub fn set_settings(&self, settings: Settings) {
        self.shared.settings.store(settings);
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        self.shared.settings.update(f);
    }

    /// Results as of the end of the latest pulse
    pub fn snapshot(&self) -> Arc<StationSnapshot> {
        self.shared.snapshot.load()
    }

    /// Request a scalar capture. Ignored if one is already running.
    pub fn trigger_scalar_capture(&self) {
        self.shared.scalar_trigger.store(true, Ordering::Release);
    }

    /// Request a waveform capture. Ignored if one is already running.
    pub fn trigger_waveform_capture(&self) {
        self.shared.waveform_trigger.store(true, Ordering::Release);
    }

    /// Per-pulse measurements, newest retained when the reader falls behind
    pub fn updates(&self) -> &Receiver<Arc<PulseSummary>> {
        &self.updates
    }

    pub fn priority(&self) -> u8 {
        self.shared.priority.load(Ordering::Relaxed)
    }
}

/// One LLRF station: configuration, an optional backend, and its control thread.
pub struct Station {
    config: StationConfig,
    shared: Arc<StationShared>,
    updates: (Sender<Arc<PulseSummary>>, Receiver<Arc<PulseSummary>>),
    backend_name: Option<String>,
    /// The loop while no thread is running it
    idle: Option<ControlLoop>,
    thread: Option<JoinHandle<ControlLoop>>,
}

impl Station {
    pub fn new(config: StationConfig) -> Self {
        let shared = Arc::new(StationShared::new(&config));
        Self {
            config,
            shared,
            updates: bounded(UPDATE_QUEUE_DEPTH),
            backend_name: None,
            idle: None,
            thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Name of the associated backend, if any
    pub fn backend_name(&self) -> Option<&str> {
        self.backend_name.as_deref()
    }

    pub fn handle(&self) -> StationHandle {
        StationHandle {
            name: self.config.name.clone(),
            shared: Arc::clone(&self.shared),
            updates: self.updates.1.clone(),
        }
    }

    /// Initialize `backend` and make it this station's acquisition backend.
    pub fn associate(
        &mut self,
        backend_name: &str,
        mut backend: Box<dyn AcquisitionAdapter>,
    ) -> Result<(), ConfigurationError> {
        self.check_unassociated()?;
        backend
            .init()
            .map_err(|source| ConfigurationError::BackendInit {
                name: backend_name.to_owned(),
                source,
            })?;
        self.attach(backend_name, backend)
    }

    pub(crate) fn check_unassociated(&self) -> Result<(), ConfigurationError> {
        match &self.backend_name {
            Some(backend) => Err(ConfigurationError::AlreadyAssociated {
                station: self.config.name.clone(),
                backend: backend.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Take an already initialized backend.
    pub(crate) fn attach(
        &mut self,
        backend_name: &str,
        backend: Box<dyn AcquisitionAdapter>,
    ) -> Result<(), ConfigurationError> {
        self.check_unassociated()?;
        info!(
            "Station {} associated with backend {backend_name} ({})",
            self.config.name,
            backend.kind()
        );
        self.idle = Some(ControlLoop::new(
            self.config.clone(),
            backend,
            Arc::clone(&self.shared),
            self.updates.clone(),
        ));
        self.backend_name = Some(backend_name.to_owned());
        Ok(())
    }

    /// Set the control thread priority. A running thread picks it up on its next pulse.
    pub fn set_priority(&self, priority: u8) -> Result<(), ConfigurationError> {
        if priority > MAX_PRIORITY {
            return Err(ConfigurationError::InvalidPriority(priority.to_string()));
        }
        self.shared.priority.store(priority, Ordering::Relaxed);
        info!("Station {} priority request {priority}", self.config.name);
        Ok(())
    }

    /// Start the control thread. Does nothing if it is already running.
    pub fn start(&mut self) -> Result<(), ConfigurationError> {
        if self.is_running() {
            return Ok(());
        }
        // Reclaim the loop from a thread that has already exited
        self.stop();

        let mut control = self
            .idle
            .take()
            .ok_or_else(|| ConfigurationError::MissingAssociation(self.config.name.clone()))?;
        self.shared.stop.store(false, Ordering::Relaxed);

        let thread = thread::Builder::new()
            .name(logging::thread_name(&self.config.name))
            .spawn(move || {
                control.run();
                control
            })
            .map_err(|source| ConfigurationError::Spawn {
                name: self.config.name.clone(),
                source,
            })?;
        self.thread = Some(thread);
        info!("Station {} control thread started", self.config.name);
        Ok(())
    }

    /// Check if the control thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Ask the control thread to exit after its current pulse and wait for it.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(control) => self.idle = Some(control),
                Err(_) => error!("Station {} control thread panicked", self.config.name),
            }
        }
    }

    /// Stop the thread and give back the backend, leaving the station unassociated.
    pub fn release_backend(&mut self) -> Option<(String, Box<dyn AcquisitionAdapter>)> {
        self.stop();
        let control = self.idle.take()?;
        let name = self.backend_name.take()?;
        Some((name, control.into_backend()))
    }
}

impl Drop for Station {
    /// Make sure the control thread exits with the station.
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBoard, Sis8300Config, Sis8300Iqfb};
    use std::time::{Duration, Instant};

    fn simulated_backend(period: Duration) -> Box<dyn AcquisitionAdapter> {
        let mut fw = Sis8300Iqfb::new(Sis8300Config::default());
        fw.associate(Box::new(SimulatedBoard::new(period))).unwrap();
        Box::new(fw)
    }

    fn config() -> StationConfig {
        let mut cfg = StationConfig::new("unit");
        cfg.scalar_session_length = 4;
        cfg.waveform_session_length = 2;
        cfg.interrupt_timeout_ms = 10;
        cfg
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn start_requires_association() {
        let mut station = Station::new(config());
        assert!(matches!(
            station.start(),
            Err(ConfigurationError::MissingAssociation(_))
        ));
    }

    #[test]
    fn second_association_is_rejected() {
        let mut station = Station::new(config());
        station
            .associate("board0", simulated_backend(Duration::ZERO))
            .unwrap();
        assert!(matches!(
            station.associate("board1", simulated_backend(Duration::ZERO)),
            Err(ConfigurationError::AlreadyAssociated { .. })
        ));
        assert_eq!(station.backend_name(), Some("board0"));
    }

    #[test]
    fn start_is_idempotent_and_stop_joins() {
        let mut station = Station::new(config());
        station
            .associate("board0", simulated_backend(Duration::from_millis(1)))
            .unwrap();
        let handle = station.handle();

        station.start().unwrap();
        station.start().unwrap();
        assert!(station.is_running());
        assert!(wait_for(|| handle.snapshot().pulse.iteration > 3));

        station.stop();
        assert!(!station.is_running());
        let stopped_at = handle.snapshot().pulse.iteration;

        // Restart resumes the same loop
        station.start().unwrap();
        assert!(wait_for(|| handle.snapshot().pulse.iteration > stopped_at));
        station.stop();
    }

    #[test]
    fn priority_is_range_checked() {
        let station = Station::new(config());
        assert!(station.set_priority(99).is_ok());
        assert_eq!(station.handle().priority(), 99);
        assert!(matches!(
            station.set_priority(100),
            Err(ConfigurationError::InvalidPriority(_))
        ));
    }

    #[test]
    fn stop_returns_promptly_without_interrupts() {
        let mut station = Station::new(config());
        let mut fw = Sis8300Iqfb::new(Sis8300Config::default());
        let board = SimulatedBoard::new(Duration::from_millis(1));
        board.handle().set_paused(true);
        fw.associate(Box::new(board)).unwrap();
        station.associate("board0", Box::new(fw)).unwrap();

        station.start().unwrap();
        let t0 = Instant::now();
        station.stop();
        assert!(t0.elapsed() < Duration::from_secs(2));
        assert_eq!(station.handle().snapshot().pulse.iteration, 0);
    }

    #[test]
    fn settings_updates_from_two_handles_both_land() {
        let station = Station::new(config());
        let writers: Vec<_> = (0..2)
            .map(|i| {
                let handle = station.handle();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        handle.update_settings(|s| s.probe_selectors[i] += 1);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(station.handle().settings().probe_selectors, [2000, 2000]);
    }

    #[test]
    fn release_returns_backend() {
        let mut station = Station::new(config());
        station
            .associate("board0", simulated_backend(Duration::ZERO))
            .unwrap();
        let (name, backend) = station.release_backend().unwrap();
        assert_eq!(name, "board0");
        assert_eq!(backend.max_sample_count(), 512);
        assert_eq!(station.backend_name(), None);
    }
}
