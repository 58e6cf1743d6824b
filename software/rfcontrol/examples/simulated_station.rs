//! Run a station against a software model of the board.
//!
//! Demonstrated here:
//!   * Registering a backend and configuring a station through the manager
//!   * Closing the phase loop with feedback, then stepping the setpoint with feed-forward
//!   * Reading published snapshots and the slow-consumer queue
//!   * Triggering a scalar capture and waiting for the file

use std::thread;
use std::time::Duration;

use rfcontrol::backend::{AcquisitionAdapter, SimulatedBoard, Sis8300Config, Sis8300Iqfb};
use rfcontrol::logging::init_logging;
use rfcontrol::signal::RfChannel;
use rfcontrol::{Manager, StationConfig};

use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let op_dir = std::env::temp_dir().join("rfcontrol_demo");
    std::fs::create_dir_all(&op_dir)?;
    init_logging(&op_dir, "simulated_station")?;

    // A 100 Hz board whose klystron phase drifts
    let board = SimulatedBoard::new(Duration::from_millis(10));
    let model = board.handle();
    model.set_drift_deg(6.0);
    let mut firmware = Sis8300Iqfb::new(Sis8300Config::default());
    firmware.associate(Box::new(board))?;

    let mut manager = Manager::new();
    manager.register_backend("sis8300_0", Box::new(firmware))?;

    let mut config = StationConfig::new("demo");
    config.op_dir = op_dir.clone();
    config.scalar_session_length = 200;
    config.waveform_session_length = 20;
    config.capture.folder = op_dir.clone();
    let station = manager.create_with(config)?;

    manager.configure("demo", "RFCFW_NAME", "sis8300_0")?;
    manager.configure("demo", "THRD_PRIO", "60")?;
    station.update_settings(|s| {
        s.feedback.setpoint_deg = 25.0;
        s.feedback.gain = 0.3;
        s.feedback.feedback_enabled = true;
        s.feedback.feedforward_enabled = true;
        s.probe_selectors = [0, 11];
    });
    manager.configure("demo", "THRD_CRAT", "")?;

    thread::sleep(Duration::from_millis(500));
    let snap = station.snapshot();
    info!(
        "After settling: SLED phase {:.2} deg, error {:.3} deg, status {:#x}",
        snap.pulse.rf(RfChannel::SledOutput).avg_pha_deg,
        snap.pulse.feedback.error_deg,
        snap.status.0
    );

    // Feed-forward takes the step in one pulse
    station.update_settings(|s| s.feedback.setpoint_deg = 40.0);
    thread::sleep(Duration::from_millis(100));
    for pulse in station.updates().try_iter() {
        info!(
            "pulse {}: {:?}, SLED {:.2} deg",
            pulse.iteration,
            pulse.feedback.action,
            pulse.rf(RfChannel::SledOutput).avg_pha_deg
        );
    }

    station.trigger_scalar_capture();
    while station.snapshot().capture_status.is_empty() {
        thread::sleep(Duration::from_millis(50));
    }
    let snap = station.snapshot();
    info!("{}", snap.capture_status);
    info!(
        "{} interrupts, {} missed, median delay {}",
        snap.interrupts.irq_count, snap.interrupts.missed, snap.interrupts.delay_filtered
    );

    manager.delete("demo")?;
    Ok(())
}
