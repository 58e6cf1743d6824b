//! Full stations on the simulated board, driven through the manager.

use std::thread;
use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;

use rfcontrol::backend::{
    AcquisitionAdapter, SimulatedBoard, SimulatedBoardHandle, Sis8300Config, Sis8300Iqfb,
};
use rfcontrol::controller::StatusBits;
use rfcontrol::feedback::FeedbackAction;
use rfcontrol::signal::RfChannel;
use rfcontrol::{Manager, StationConfig, StationHandle};

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

/// A running station named "kly" on a 1 kHz simulated board.
fn running_station(dir: &std::path::Path) -> (Manager, StationHandle, SimulatedBoardHandle) {
    let board = SimulatedBoard::new(Duration::from_millis(1));
    let model = board.handle();
    let mut fw = Sis8300Iqfb::new(Sis8300Config::default());
    fw.associate(Box::new(board)).unwrap();

    let mut manager = Manager::new();
    manager.register_backend("sim", Box::new(fw)).unwrap();

    let mut config = StationConfig::new("kly");
    config.op_dir = dir.to_path_buf();
    config.history_depth = 64;
    config.scalar_session_length = 50;
    config.waveform_session_length = 4;
    config.waveform_point_cap = 32;
    config.interrupt_timeout_ms = 20;
    config.history_publish_every = 1;
    config.capture.folder = dir.to_path_buf();
    let station = manager.create_with(config).unwrap();

    manager.configure("kly", "backend", "sim").unwrap();
    manager.configure("kly", "start", "").unwrap();
    (manager, station, model)
}

#[test]
fn feedback_holds_phase_against_drift() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, station, model) = running_station(dir.path());
    station.update_settings(|s| {
        s.feedback.setpoint_deg = 30.0;
        s.feedback.gain = 0.4;
        s.feedback.feedback_enabled = true;
    });

    model.set_drift_deg(-4.0);
    let settled = wait_for(Duration::from_secs(5), || {
        let snap = station.snapshot();
        snap.pulse.iteration > 50
            && (snap.pulse.rf(RfChannel::SledOutput).avg_pha_deg - 30.0).abs() < 0.2
    });
    assert!(settled, "loop did not settle: {:?}", station.snapshot().pulse);
    assert_abs_diff_eq!(model.actuation_deg(), 9.0, epsilon = 0.3);

    let snap = station.snapshot();
    assert!(snap.status.is_set(StatusBits::FEEDBACK_ENABLED));
    assert!(snap.status.is_set(StatusBits::PRIMARY_WEIGHTED));
    assert!(!snap.status.is_set(StatusBits::HARDWARE_UNAVAILABLE));
    manager.delete("kly").unwrap();
}

#[test]
fn setpoint_step_is_taken_by_feedforward() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, station, _model) = running_station(dir.path());
    station.update_settings(|s| {
        s.feedback.setpoint_deg = 25.0;
        s.feedback.feedforward_enabled = true;
    });
    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().pulse.iteration > 5
    }));
    while station.updates().try_recv().is_ok() {}

    station.update_settings(|s| s.feedback.setpoint_deg = 45.0);
    let mut actions = Vec::new();
    let collected = wait_for(Duration::from_secs(5), || {
        actions.extend(station.updates().try_iter().map(|p| p.feedback.action));
        actions.len() > 5
    });
    assert!(collected);

    let fired: Vec<f64> = actions
        .iter()
        .filter_map(|a| match a {
            FeedbackAction::FeedForward(adj) => Some(*adj),
            _ => None,
        })
        .collect();
    assert_eq!(fired.len(), 1, "feed-forward fires once: {actions:?}");
    assert_abs_diff_eq!(fired[0], 20.0, epsilon = 0.2);
    assert_abs_diff_eq!(
        station.snapshot().pulse.rf(RfChannel::SledOutput).avg_pha_deg,
        45.0,
        epsilon = 0.2
    );
    manager.delete("kly").unwrap();
}

#[test]
fn scalar_capture_file_holds_every_source() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, station, _model) = running_station(dir.path());
    station.trigger_scalar_capture();

    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().capture_status.ends_with("saved!")
    }));
    let bytes = std::fs::read(dir.path().join("scalar_capture.bin")).unwrap();
    let values: Vec<f64> = bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    // Registry order: fb error, fb adjustment, then REF avg I, Q, amp, pha, ...
    let sources = 2 + 4 * RfChannel::ALL.len() + 1;
    assert_eq!(values.len(), sources * 50);
    let ref_amp = &values[4 * 50..5 * 50];
    for v in ref_amp {
        assert_abs_diff_eq!(*v, 12_000.0, epsilon = 2.0);
    }
    assert_eq!(station.snapshot().capture.scalar_percent, 100);
    manager.delete("kly").unwrap();
}

#[test]
fn waveform_capture_file_matches_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, station, _model) = running_station(dir.path());
    station.trigger_waveform_capture();

    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().capture_status.ends_with("saved!")
    }));
    let bytes = std::fs::read(dir.path().join("waveform_capture.bin")).unwrap();
    let sources = RfChannel::ALL.len() + 1;
    assert_eq!(bytes.len(), sources * 4 * 32 * 2);

    // The last source is the beam voltage, a constant level
    let hv = &bytes[(sources - 1) * 4 * 32 * 2..];
    for c in hv.chunks_exact(2) {
        assert_eq!(i16::from_le_bytes([c[0], c[1]]), 2000);
    }
    manager.delete("kly").unwrap();
}

#[test]
fn missed_and_stalled_interrupts_are_observed_without_stopping() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, station, model) = running_station(dir.path());
    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().pulse.iteration > 3
    }));

    model.skip_pulses(5);
    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().interrupts.missed == 1
    }));

    model.set_paused(true);
    thread::sleep(Duration::from_millis(100));
    assert!(manager.is_running("kly"), "a stalled board never ends the loop");
    let before = station.snapshot().pulse.iteration;

    // Timeouts are published with the next pulse
    model.set_paused(false);
    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().pulse.iteration > before + 3
    }));
    let stats = station.snapshot().interrupts;
    assert!(stats.timeouts > 0);
    assert_eq!(stats.missed, 1);
    manager.delete("kly").unwrap();
}

#[test]
fn delete_stops_the_thread() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, station, model) = running_station(dir.path());
    assert!(wait_for(Duration::from_secs(5), || {
        station.snapshot().pulse.iteration > 3
    }));

    manager.delete("kly").unwrap();
    assert!(!manager.is_running("kly"));
    let pulses = model.pulse_count();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(model.pulse_count(), pulses, "no interrupts consumed after delete");
    assert_eq!(manager.available_backends().collect::<Vec<_>>(), vec!["sim"]);
}
