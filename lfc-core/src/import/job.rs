//! Asynchronous import jobs.
//!
//! One worker thread per job runs parse -> map -> validate -> (optional)
//! live detection. A successful job holds the mapped profile in memory;
//! persisting it and making it active is a separate commit step, so a
//! failed or cancelled import never touches the profiles directory.
//!
//! Progress is monotone and the state only moves forward:
//! Running -> Succeeded | Failed | Canceled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lfc_error::{LfcError, Result};

use crate::hw::detection::{DetectionJob, DetectionTarget, DetectionTiming};
use crate::hw::Inventory;
use crate::import::fancontrol::parse_legacy;
use crate::import::mapping::{map_pwm, map_temp};
use crate::profile::{
    validate_against_inventory, CurvePoint, Profile, Rule, Source, SourceSettings,
    ValidationReport,
};
use crate::vendor::VendorMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImportState {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

/// Progress snapshot exposed over RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStatus {
    pub id: u64,
    pub state: ImportState,
    /// 0-100, never decreases within a job
    pub progress: u8,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub profile_name: String,
}

/// Knobs for one import run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub validate_detect: bool,
    pub rpm_min: u32,
    pub timeout_ms: Option<u64>,
    pub detection_timing: DetectionTiming,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            validate_detect: false,
            rpm_min: 0,
            timeout_ms: None,
            detection_timing: DetectionTiming::default(),
        }
    }
}

/// Handle to one import job.
pub struct ImportJob {
    status: Arc<Mutex<ImportStatus>>,
    cancel: Arc<AtomicBool>,
    result: Arc<Mutex<Option<Profile>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ImportJob {
    /// Spawn the import worker.
    ///
    /// `inventory` is a snapshot copy; `detection_gate` serialises live
    /// detection with any other detection activity in the process.
    pub fn start(
        id: u64,
        source_path: PathBuf,
        profile_name: String,
        inventory: Inventory,
        vendor_map: Option<Arc<parking_lot::RwLock<VendorMap>>>,
        options: ImportOptions,
        detection_gate: Arc<Mutex<()>>,
    ) -> Self {
        let status = Arc::new(Mutex::new(ImportStatus {
            id,
            state: ImportState::Running,
            progress: 0,
            stage: "parse".to_string(),
            current_identifier: None,
            mapped_path: None,
            validation: None,
            error: None,
            profile_name: profile_name.clone(),
        }));
        let cancel = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let worker = ImportWorker {
            status: status.clone(),
            cancel: cancel.clone(),
            result: result.clone(),
            source_path,
            profile_name,
            inventory,
            vendor_map,
            options,
            detection_gate,
        };
        let handle = crate::spawn_worker(format!("lfc-import-{}", id), move || worker.run());

        Self {
            status,
            cancel,
            result,
            handle: Some(handle),
        }
    }

    pub fn status(&self) -> ImportStatus {
        self.status.lock().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.lock().state != ImportState::Running
    }

    /// Request cancellation. Terminal jobs cannot be cancelled.
    pub fn cancel(&self) -> Result<()> {
        let state = self.status.lock().state;
        if state != ImportState::Running {
            return Err(LfcError::NotCancelable(format!(
                "import job is already {:?}",
                state
            )));
        }
        self.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Take the mapped profile out of a succeeded job (commit step).
    pub fn take_result(&self) -> Result<Profile> {
        if self.status.lock().state != ImportState::Succeeded {
            return Err(LfcError::CommitFailed(
                "import job has not succeeded".to_string(),
            ));
        }
        self.result
            .lock()
            .take()
            .ok_or_else(|| LfcError::CommitFailed("import result already committed".to_string()))
    }

    /// Block until the worker finishes (tests and shutdown).
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ImportJob {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct ImportWorker {
    status: Arc<Mutex<ImportStatus>>,
    cancel: Arc<AtomicBool>,
    result: Arc<Mutex<Option<Profile>>>,
    source_path: PathBuf,
    profile_name: String,
    inventory: Inventory,
    vendor_map: Option<Arc<parking_lot::RwLock<VendorMap>>>,
    options: ImportOptions,
    detection_gate: Arc<Mutex<()>>,
}

impl ImportWorker {
    fn set_stage(&self, stage: &str, progress: u8) {
        let mut status = self.status.lock();
        status.stage = stage.to_string();
        status.progress = status.progress.max(progress);
    }

    fn fail(&self, error: impl Into<String>) {
        let mut status = self.status.lock();
        status.state = ImportState::Failed;
        status.error = Some(error.into());
        status.progress = 100;
        warn!(job = status.id, error = ?status.error, "import failed");
    }

    fn cancelled(&self) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            let mut status = self.status.lock();
            status.state = ImportState::Canceled;
            status.progress = 100;
            info!(job = status.id, "import cancelled");
            true
        } else {
            false
        }
    }

    fn run(self) {
        // Parse.
        self.set_stage("parse", 5);
        let text = match std::fs::read_to_string(&self.source_path) {
            Ok(text) => text,
            Err(e) => return self.fail(format!("{}: {}", self.source_path.display(), e)),
        };
        let controls = match parse_legacy(&text) {
            Ok(controls) => controls,
            Err(e) => return self.fail(e.to_string()),
        };
        if self.cancelled() {
            return;
        }

        // Map, control by control, surfacing progress per identifier.
        self.set_stage("map", 10);
        let vendor_guard = self.vendor_map.as_ref().map(|m| m.read());
        let vendor: Option<&VendorMap> = vendor_guard.as_deref();

        let mut profile = Profile::new(&self.profile_name);
        profile.description = Some("imported from FanControl".to_string());
        let mut warnings = Vec::new();

        for (index, control) in controls.iter().enumerate() {
            {
                let mut status = self.status.lock();
                status.current_identifier = Some(control.identifier.clone());
                status.mapped_path = None;
            }
            let temp_path = match map_temp(&control.sensor, &self.inventory, &mut warnings) {
                Ok(path) => path,
                Err(e) => return self.fail(e.to_string()),
            };
            let pwm_path =
                match map_pwm(&control.identifier, &self.inventory, vendor, &mut warnings) {
                    Ok(path) => path,
                    Err(e) => return self.fail(e.to_string()),
                };
            {
                let mut status = self.status.lock();
                status.mapped_path = Some(pwm_path.display().to_string());
            }

            profile.rules.push(Rule {
                pwm_path,
                nickname: Some(control.identifier.clone()),
                sources: vec![Source {
                    temp_paths: vec![temp_path],
                    points: control
                        .points
                        .iter()
                        .map(|(temp_c, percent)| CurvePoint {
                            temp_c: *temp_c,
                            percent: *percent,
                        })
                        .collect(),
                    settings: SourceSettings {
                        hysteresis_c: control.hysteresis_c.max(0.0),
                        response_tau_seconds: control.response_time_s.max(0.0),
                        ..SourceSettings::default()
                    },
                }],
            });

            let progress = 10 + ((index + 1) * 50 / controls.len()) as u8;
            self.set_stage("map", progress);
            if self.cancelled() {
                return;
            }
        }

        // Validate.
        self.set_stage("validate", 75);
        let mut report = validate_against_inventory(&profile, &self.inventory);
        report.warnings.extend(warnings);
        let validation_failed = !report.ok;
        self.status.lock().validation = Some(report);
        if validation_failed {
            return self.fail("validation failed, profile not saved");
        }
        if self.cancelled() {
            return;
        }

        // Optional live detection gate.
        if self.options.validate_detect {
            self.set_stage("detect", 85);
            if let Err(e) = self.run_detection_gate(&profile) {
                return self.fail(e.to_string());
            }
            if self.cancelled() {
                return;
            }
        }

        *self.result.lock() = Some(profile);
        let mut status = self.status.lock();
        status.state = ImportState::Succeeded;
        status.progress = 100;
        status.stage = "done".to_string();
        info!(job = status.id, profile = %status.profile_name, "import succeeded");
    }

    /// Run a synchronous detection sweep over the profile's PWMs and
    /// require each to reach `rpm_min`.
    fn run_detection_gate(&self, profile: &Profile) -> Result<()> {
        let targets: Vec<DetectionTarget> = profile
            .rules
            .iter()
            .filter_map(|rule| {
                let pwm = self.inventory.pwm_by_path(&rule.pwm_path)?;
                Some(DetectionTarget {
                    pwm_path: pwm.pwm_path.clone(),
                    enable_path: pwm.enable_path.clone(),
                    pwm_max: pwm.pwm_max,
                    chip_path: pwm.chip_path.clone(),
                    tach_paths: self
                        .inventory
                        .tachs_on_chip(&pwm.chip_path)
                        .map(|t| t.input_path.clone())
                        .collect(),
                })
            })
            .collect();

        // Only one detection may drive the PWMs at a time.
        let _gate = self.detection_gate.lock();
        let job = DetectionJob::start(0, targets, self.options.detection_timing);

        let deadline = self
            .options
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        while !job.is_terminal() {
            if self.cancel.load(Ordering::SeqCst) {
                job.abort();
            }
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    job.abort();
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        let outcome = job.join();

        let failing: Vec<String> = outcome
            .per_pwm_peak_rpm
            .iter()
            .filter(|peak| peak.peak_rpm < self.options.rpm_min)
            .map(|peak| format!("{} peaked at {} RPM", peak.pwm_path.display(), peak.peak_rpm))
            .collect();
        if !failing.is_empty() {
            return Err(LfcError::ValidationFailed(format!(
                "detection gate requires {} RPM: {}",
                self.options.rpm_min,
                failing.join("; ")
            )));
        }
        Ok(())
    }
}
