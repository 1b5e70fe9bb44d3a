//! PWM coupling detection.
//!
//! For each PWM output the sweep ramps the duty to full, holds it for a
//! settle window, and records the peak RPM observed on any tach of the same
//! chip. The result verifies that a profile's PWM/tach pairing actually
//! moves air. Exactly one job may run at a time; the engine is suspended for
//! its duration (the daemon enforces both).
//!
//! The job is a phase machine with cooperative cancellation: the abort flag
//! is checked between phases and at every sampling point, and the Restore
//! phase runs regardless of how the sweep ended.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::detection;
use crate::hw::access::{self, EnableRestore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionState {
    Idle,
    Running,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionPhase {
    Baseline,
    Ramp,
    Settle,
    Record,
    Restore,
}

/// Measured peak for one PWM
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PwmPeak {
    pub pwm_path: PathBuf,
    pub peak_rpm: u32,
}

/// Snapshot of a job's progress, safe to expose over RPC and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub id: u64,
    pub state: DetectionState,
    pub phase: DetectionPhase,
    pub current_index: usize,
    pub total: usize,
    pub per_pwm_peak_rpm: Vec<PwmPeak>,
}

impl DetectionStatus {
    fn new(id: u64, total: usize) -> Self {
        Self {
            id,
            state: DetectionState::Idle,
            phase: DetectionPhase::Baseline,
            current_index: 0,
            total,
            per_pwm_peak_rpm: Vec::new(),
        }
    }
}

/// One PWM to sweep, with everything needed to drive and restore it.
#[derive(Debug, Clone)]
pub struct DetectionTarget {
    pub pwm_path: PathBuf,
    pub enable_path: Option<PathBuf>,
    pub pwm_max: u32,
    pub chip_path: PathBuf,
    /// Tachs on the same chip, sampled during the settle window
    pub tach_paths: Vec<PathBuf>,
}

/// Timing knobs; tests shorten these.
#[derive(Debug, Clone, Copy)]
pub struct DetectionTiming {
    pub settle: Duration,
    pub sample_interval: Duration,
}

impl Default for DetectionTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(detection::SETTLE_MS),
            sample_interval: Duration::from_millis(detection::SAMPLE_INTERVAL_MS),
        }
    }
}

/// Handle to a running (or finished) detection job.
pub struct DetectionJob {
    status: Arc<Mutex<DetectionStatus>>,
    abort: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DetectionJob {
    /// Spawn the detection worker thread.
    pub fn start(id: u64, targets: Vec<DetectionTarget>, timing: DetectionTiming) -> Self {
        let status = Arc::new(Mutex::new(DetectionStatus::new(id, targets.len())));
        let abort = Arc::new(AtomicBool::new(false));

        let worker_status = status.clone();
        let worker_abort = abort.clone();
        let handle = crate::spawn_worker(format!("lfc-detect-{}", id), move || {
            run_sweep(targets, timing, worker_status, worker_abort)
        });

        Self {
            status,
            abort,
            handle: Some(handle),
        }
    }

    pub fn status(&self) -> DetectionStatus {
        self.status.lock().clone()
    }

    /// Request a cooperative abort. Restore still runs.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.lock().state,
            DetectionState::Done | DetectionState::Aborted
        )
    }

    /// Block until the worker exits (used on shutdown and in tests).
    pub fn join(mut self) -> DetectionStatus {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.status.lock().clone()
    }
}

impl Drop for DetectionJob {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Baseline {
    raw: u32,
    guard: Option<EnableRestore>,
}

fn run_sweep(
    targets: Vec<DetectionTarget>,
    timing: DetectionTiming,
    status: Arc<Mutex<DetectionStatus>>,
    abort: Arc<AtomicBool>,
) {
    let aborted = |s: &Arc<AtomicBool>| s.load(Ordering::SeqCst);
    info!(pwms = targets.len(), "detection sweep starting");
    {
        let mut s = status.lock();
        s.state = DetectionState::Running;
        s.phase = DetectionPhase::Baseline;
    }

    // Baseline: capture raw values and enable modes, switch to manual.
    let mut baselines: Vec<Baseline> = Vec::with_capacity(targets.len());
    for target in &targets {
        let raw = access::read_raw(&target.pwm_path).unwrap_or(0);
        let guard = match target.enable_path.as_deref() {
            Some(enable_path) => match EnableRestore::acquire(enable_path) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(path = ?enable_path, error = %e, "could not switch PWM to manual");
                    None
                }
            },
            None => None,
        };
        baselines.push(Baseline { raw, guard });
    }

    // Sweep each PWM unless aborted.
    for (index, target) in targets.iter().enumerate() {
        if aborted(&abort) {
            break;
        }
        {
            let mut s = status.lock();
            s.current_index = index;
            s.phase = DetectionPhase::Ramp;
        }

        let full = crate::constants::pwm::from_percent(detection::RAMP_PERCENT, target.pwm_max);
        if let Err(e) = access::write_pwm_raw(&target.pwm_path, full, target.pwm_max) {
            warn!(path = ?target.pwm_path, error = %e, "ramp write failed, skipping PWM");
            status.lock().per_pwm_peak_rpm.push(PwmPeak {
                pwm_path: target.pwm_path.clone(),
                peak_rpm: 0,
            });
            continue;
        }

        status.lock().phase = DetectionPhase::Settle;
        let mut peak_rpm = 0u32;
        let settle_start = Instant::now();
        while settle_start.elapsed() < timing.settle {
            if aborted(&abort) {
                break;
            }
            for tach in &target.tach_paths {
                if let Ok(rpm) = access::read_rpm(tach) {
                    peak_rpm = peak_rpm.max(rpm);
                }
            }
            thread::sleep(timing.sample_interval);
        }

        {
            let mut s = status.lock();
            s.phase = DetectionPhase::Record;
            s.per_pwm_peak_rpm.push(PwmPeak {
                pwm_path: target.pwm_path.clone(),
                peak_rpm,
            });
        }
        debug!(pwm = ?target.pwm_path, peak_rpm, "recorded peak");

        // Return this PWM to its baseline before moving to the next one.
        let _ = access::write_pwm_raw(&target.pwm_path, baselines[index].raw, target.pwm_max);
    }

    // Restore runs even after abort: raw values first, then enable modes.
    status.lock().phase = DetectionPhase::Restore;
    for (target, baseline) in targets.iter().zip(baselines.into_iter()) {
        if let Err(e) = access::write_pwm_raw(&target.pwm_path, baseline.raw, target.pwm_max) {
            warn!(path = ?target.pwm_path, error = %e, "baseline restore failed");
        }
        if let Some(guard) = baseline.guard {
            if let Err(e) = guard.restore() {
                warn!(error = %e, "enable mode restore failed");
            }
        }
    }

    let mut s = status.lock();
    s.state = if aborted(&abort) {
        DetectionState::Aborted
    } else {
        DetectionState::Done
    };
    info!(state = ?s.state, measured = s.per_pwm_peak_rpm.len(), "detection sweep finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::inventory::test_support::{write_chip, FakeChip};
    use std::fs;
    use tempfile::TempDir;

    fn fast_timing() -> DetectionTiming {
        DetectionTiming {
            settle: Duration::from_millis(40),
            sample_interval: Duration::from_millis(5),
        }
    }

    fn target_from(dir: &std::path::Path) -> DetectionTarget {
        DetectionTarget {
            pwm_path: dir.join("pwm1"),
            enable_path: Some(dir.join("pwm1_enable")),
            pwm_max: 255,
            chip_path: dir.to_path_buf(),
            tach_paths: vec![dir.join("fan1_input")],
        }
    }

    #[test]
    fn sweep_records_peak_and_restores() {
        let root = TempDir::new().unwrap();
        let chip = write_chip(
            root.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[],
                fans: &[(1, 1450)],
                pwms: &[(1, 90, Some(5))],
            },
        );

        let job = DetectionJob::start(1, vec![target_from(&chip)], fast_timing());
        let status = job.join();

        assert_eq!(status.state, DetectionState::Done);
        assert_eq!(status.phase, DetectionPhase::Restore);
        assert_eq!(status.per_pwm_peak_rpm.len(), 1);
        assert_eq!(status.per_pwm_peak_rpm[0].peak_rpm, 1450);

        // Baseline raw value and enable mode are back.
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap(), "90");
        assert_eq!(fs::read_to_string(chip.join("pwm1_enable")).unwrap(), "5");
    }

    #[test]
    fn abort_still_restores() {
        let root = TempDir::new().unwrap();
        let chip = write_chip(
            root.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[],
                fans: &[(1, 700)],
                pwms: &[(1, 60, Some(2))],
            },
        );

        let slow = DetectionTiming {
            settle: Duration::from_secs(30),
            sample_interval: Duration::from_millis(5),
        };
        let job = DetectionJob::start(2, vec![target_from(&chip)], slow);
        thread::sleep(Duration::from_millis(30));
        job.abort();
        let status = job.join();

        assert_eq!(status.state, DetectionState::Aborted);
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap(), "60");
        // Enable was already manual (2): no guard was taken, mode untouched.
        assert_eq!(fs::read_to_string(chip.join("pwm1_enable")).unwrap(), "2");
    }

    #[test]
    fn status_progress_is_monotone() {
        let root = TempDir::new().unwrap();
        let chip = write_chip(
            root.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[],
                fans: &[(1, 500), (2, 900)],
                pwms: &[(1, 10, None), (2, 20, None)],
            },
        );
        let targets = vec![
            DetectionTarget {
                pwm_path: chip.join("pwm1"),
                enable_path: None,
                pwm_max: 255,
                chip_path: chip.clone(),
                tach_paths: vec![chip.join("fan1_input"), chip.join("fan2_input")],
            },
            DetectionTarget {
                pwm_path: chip.join("pwm2"),
                enable_path: None,
                pwm_max: 255,
                chip_path: chip.clone(),
                tach_paths: vec![chip.join("fan1_input"), chip.join("fan2_input")],
            },
        ];

        let job = DetectionJob::start(3, targets, fast_timing());
        let mut last_index = 0;
        while !job.is_terminal() {
            let s = job.status();
            assert!(s.current_index >= last_index);
            last_index = s.current_index;
            thread::sleep(Duration::from_millis(5));
        }
        let status = job.join();
        assert_eq!(status.per_pwm_peak_rpm.len(), 2);
        // Peak comes from any tach on the chip.
        assert_eq!(status.per_pwm_peak_rpm[0].peak_rpm, 900);
    }
}
