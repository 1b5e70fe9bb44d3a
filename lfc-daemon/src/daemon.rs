//! Daemon state and run loop.
//!
//! The main loop owns every mutable piece: the engine, the inventory, the
//! GPU monitor, the telemetry publisher, and the job registries. RPC
//! handlers run *inside* this loop - the server forwards raw request lines
//! over a command queue and awaits the reply - so handler mutations, engine
//! ticks, and telemetry publishes are naturally serialised without a web of
//! locks.
//!
//! Each iteration sleeps until the earliest due event (engine tick check,
//! forced publish, GPU refresh, hwmon refresh), clamped to [1 ms, 50 ms].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use lfc_core::config::DaemonConfig;
use lfc_core::constants::engine as engine_const;
use lfc_core::engine::{Engine, EngineTiming};
use lfc_core::hw::detection::{DetectionJob, DetectionStatus};
use lfc_core::hw::{self, Inventory};
use lfc_core::import::{ImportJob, ImportState};
use lfc_core::profile::Profile;
use lfc_core::vendor::VendorMapWatcher;
use lfc_gpu::GpuMonitor;
use lfc_protocol::telemetry as wire;
use lfc_protocol::{RpcRequest, RpcResponse, TelemetrySnapshot};

use crate::telemetry::TelemetryPublisher;

/// Commands the server (or signal handling) enqueues for the main loop.
pub enum DaemonCommand {
    /// One raw request line (single object or batch array). The reply is
    /// the serialised response, or `None` when only notifications were in
    /// the line.
    RpcLine {
        line: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown {
        restart: bool,
    },
}

/// What the loop ended with.
pub struct RunOutcome {
    pub restart: bool,
}

pub struct Daemon {
    pub config: DaemonConfig,
    pub config_path: PathBuf,
    pub inventory: Inventory,
    pub engine: Engine,
    pub gpu: GpuMonitor,
    pub vendor: VendorMapWatcher,
    pub publisher: TelemetryPublisher,

    /// The single active detection job, if any
    pub detection: Option<DetectionJob>,
    /// Results of the most recently finished detection
    pub detection_results: Option<DetectionStatus>,
    /// Profile application deferred until detection restores the PWMs
    pub pending_profile: Option<Profile>,

    pub import_jobs: HashMap<u64, ImportJob>,
    pub next_job_id: u64,
    /// Serialises live detection between detect.start and import jobs
    pub detection_gate: Arc<Mutex<()>>,

    last_hwmon_refresh: Instant,
    last_gpu_refresh: Instant,
    last_publish: Instant,
    last_tick_check: Instant,
    shutdown_requested: bool,
    restart_requested: bool,
}

impl Daemon {
    pub fn new(config: DaemonConfig, config_path: PathBuf) -> anyhow::Result<Self> {
        let mut inventory = hw::discover()?;

        let vendor = match &config.vendor_map_path {
            Some(path) => VendorMapWatcher::start(
                path.clone(),
                config.vendor_map_watch_mode,
                config.vendor_map_throttle_ms,
            ),
            None => VendorMapWatcher::empty(),
        };
        vendor.apply_to_inventory(&mut inventory);

        let mut gpu = GpuMonitor::new();
        if let Err(e) = gpu.snapshot() {
            warn!(error = %e, "GPU snapshot failed, continuing without GPUs");
        }

        let engine = Engine::new(EngineTiming {
            delta_c: config.engine.delta_c,
            force_tick_ms: config.engine.force_tick_ms,
        });

        let publisher = TelemetryPublisher::new(
            &config.shm.path,
            std::path::Path::new(lfc_core::constants::telemetry::DEFAULT_FALLBACK_FILE),
        );

        let now = Instant::now();
        Ok(Self {
            config,
            config_path,
            inventory,
            engine,
            gpu,
            vendor,
            publisher,
            detection: None,
            detection_results: None,
            pending_profile: None,
            import_jobs: HashMap::new(),
            next_job_id: 1,
            detection_gate: Arc::new(Mutex::new(())),
            last_hwmon_refresh: now,
            last_gpu_refresh: now,
            // run() publishes immediately; this only seeds the cadence.
            last_publish: now,
            last_tick_check: now,
            shutdown_requested: false,
            restart_requested: false,
        })
    }

    /// Load and apply the configured startup profile, if any.
    pub fn load_startup_profile(&mut self) {
        let Some(name) = self.config.profiles.active.clone() else {
            return;
        };
        match lfc_core::profile::load_from_dir(&self.config.profiles.dir, &name) {
            Ok(profile) => {
                let report = self.engine.apply_profile(profile, &self.inventory);
                if report.ok {
                    if let Err(e) = self.engine.enable() {
                        warn!(profile = %name, error = %e, "startup profile not enabled");
                    }
                } else {
                    warn!(
                        profile = %name,
                        errors = ?report.errors,
                        "startup profile invalid, engine stays disabled"
                    );
                }
            }
            Err(e) => warn!(profile = %name, error = %e, "startup profile not loaded"),
        }
    }

    pub fn request_shutdown(&mut self, restart: bool) {
        self.shutdown_requested = true;
        self.restart_requested = restart;
    }

    /// Main loop: serve commands and due events until shutdown.
    pub async fn run(mut self, mut commands: mpsc::Receiver<DaemonCommand>) -> RunOutcome {
        self.publish();

        while !self.shutdown_requested {
            let sleep = self.next_sleep();
            tokio::select! {
                maybe_cmd = commands.recv() => match maybe_cmd {
                    Some(DaemonCommand::RpcLine { line, reply }) => {
                        let response = self.handle_rpc_line(&line);
                        let _ = reply.send(response);
                    }
                    Some(DaemonCommand::Shutdown { restart }) => {
                        self.request_shutdown(restart);
                    }
                    None => self.request_shutdown(false),
                },
                _ = tokio::time::sleep(sleep) => {
                    self.service_due(Instant::now());
                }
            }
        }

        self.shutdown_cleanup();
        RunOutcome {
            restart: self.restart_requested,
        }
    }

    /// Earliest due event, clamped to the documented sleep window.
    fn next_sleep(&self) -> Duration {
        let now = Instant::now();
        let deadline_in = |last: Instant, period_ms: u64| {
            (last + Duration::from_millis(period_ms))
                .checked_duration_since(now)
                .unwrap_or(Duration::ZERO)
        };

        let mut earliest = deadline_in(self.last_hwmon_refresh, self.config.hwmon_refresh_ms);
        earliest = earliest.min(deadline_in(self.last_gpu_refresh, self.config.gpu_refresh_ms));
        earliest = earliest.min(deadline_in(
            self.last_publish,
            self.config.engine.force_tick_ms,
        ));
        earliest = earliest.min(deadline_in(self.last_tick_check, self.config.engine.tick_ms));

        earliest.clamp(
            Duration::from_millis(engine_const::MIN_SLEEP_MS),
            Duration::from_millis(engine_const::MAX_SLEEP_MS),
        )
    }

    /// Run everything whose deadline passed.
    fn service_due(&mut self, now: Instant) {
        self.poll_jobs();

        if now.duration_since(self.last_hwmon_refresh)
            >= Duration::from_millis(self.config.hwmon_refresh_ms)
        {
            hw::refresh_values(&mut self.inventory);
            self.last_hwmon_refresh = now;
        }

        if now.duration_since(self.last_gpu_refresh)
            >= Duration::from_millis(self.config.gpu_refresh_ms)
        {
            self.gpu.refresh_metrics();
            self.last_gpu_refresh = now;
        }

        if now.duration_since(self.last_tick_check)
            >= Duration::from_millis(self.config.engine.tick_ms)
        {
            self.last_tick_check = now;
            if self.engine.needs_tick(&self.inventory, now) {
                let changed = self.engine.tick(&mut self.inventory, now);
                debug!(changed = changed.len(), "engine tick");
                self.publish();
            }
        }

        // Forced publish keeps readers fresh even when nothing ticks.
        if now.duration_since(self.last_publish)
            >= Duration::from_millis(self.config.engine.force_tick_ms)
        {
            self.publish();
        }
    }

    /// Reap terminal jobs and keep engine suspension in sync with them.
    fn poll_jobs(&mut self) {
        let detection_finished = self
            .detection
            .as_ref()
            .map(|job| job.is_terminal())
            .unwrap_or(false);
        if detection_finished {
            if let Some(job) = self.detection.take() {
                let status = job.join();
                info!(state = ?status.state, "detection job finished");
                self.detection_results = Some(status);
            }
        }

        let import_detect_active = self.import_jobs.values().any(|job| {
            let status = job.status();
            status.state == ImportState::Running && status.stage == "detect"
        });
        let want_suspended = self.detection.is_some() || import_detect_active;

        if want_suspended && !self.engine.is_suspended() {
            info!("suspending engine while detection drives the PWMs");
            self.engine.suspend();
        } else if !want_suspended && self.engine.is_suspended() {
            info!("resuming engine");
            self.engine.resume();

            // A profile that arrived during detection applies only now,
            // after Restore completed.
            if let Some(profile) = self.pending_profile.take() {
                let report = self.engine.apply_profile(profile, &self.inventory);
                if report.ok {
                    if let Err(e) = self.engine.enable() {
                        warn!(error = %e, "deferred profile not enabled");
                    }
                } else {
                    warn!(errors = ?report.errors, "deferred profile invalid");
                }
            }
        }
    }

    /// Apply a profile now, or defer it while detection owns the PWMs.
    pub fn apply_or_defer_profile(&mut self, profile: Profile) -> Result<Value, String> {
        if self.detection.is_some() || self.engine.is_suspended() {
            info!(profile = %profile.name, "detection active, profile application deferred");
            self.pending_profile = Some(profile);
            return Ok(serde_json::json!({ "deferred": true }));
        }
        let report = self.engine.apply_profile(profile, &self.inventory);
        let enabled = if report.ok {
            self.engine.enable().is_ok()
        } else {
            false
        };
        serde_json::to_value(serde_json::json!({
            "deferred": false,
            "enabled": enabled,
            "validation": report,
        }))
        .map_err(|e| e.to_string())
    }

    pub fn allocate_job_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    // ========================================================================
    // RPC line handling (single objects and batches)
    // ========================================================================

    pub fn handle_rpc_line(&mut self, line: &str) -> Option<String> {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                let response = RpcResponse::error(
                    Value::Null,
                    lfc_error::rpc_code::PARSE_ERROR,
                    format!("parse error: {}", e),
                );
                return serde_json::to_string(&response).ok();
            }
        };

        match parsed {
            Value::Array(entries) => {
                if entries.is_empty() {
                    let response = RpcResponse::error(
                        Value::Null,
                        lfc_error::rpc_code::INVALID_REQUEST,
                        "empty batch",
                    );
                    return serde_json::to_string(&response).ok();
                }
                // Responses mirror request order; notifications drop out.
                let responses: Vec<RpcResponse> = entries
                    .into_iter()
                    .filter_map(|entry| self.handle_single(entry))
                    .collect();
                if responses.is_empty() {
                    None
                } else {
                    serde_json::to_string(&responses).ok()
                }
            }
            other => self
                .handle_single(other)
                .and_then(|response| serde_json::to_string(&response).ok()),
        }
    }

    fn handle_single(&mut self, value: Value) -> Option<RpcResponse> {
        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return Some(RpcResponse::error(
                    Value::Null,
                    lfc_error::rpc_code::INVALID_REQUEST,
                    format!("invalid request: {}", e),
                ));
            }
        };
        if let Err(reason) = request.validate_envelope() {
            return Some(RpcResponse::error(
                request.id.unwrap_or(Value::Null),
                lfc_error::rpc_code::INVALID_REQUEST,
                reason,
            ));
        }

        let is_notification = request.is_notification();
        let id = request.id.clone().unwrap_or(Value::Null);
        let outcome = self.dispatch(&request.method, request.params.as_ref());

        if is_notification {
            return None;
        }
        Some(match outcome {
            Ok(data) => RpcResponse::success(id, &request.method, Some(data)),
            Err(error) => RpcResponse::error(id, error.code, error.message),
        })
    }

    // ========================================================================
    // Telemetry
    // ========================================================================

    pub fn publish(&mut self) {
        let snapshot = self.telemetry_snapshot();
        if let Err(e) = self.publisher.publish(&snapshot) {
            warn!(error = %e, "telemetry publish failed");
        }
        self.last_publish = Instant::now();
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let profile = self.engine.profile().map(|p| wire::ProfileSummary {
            name: p.name.clone(),
            schema: p.schema_version,
            description: p.description.clone(),
            curve_count: p.curve_count(),
            control_count: p.control_count(),
        });

        let hwmon = wire::HwmonTelemetry {
            chips: self
                .inventory
                .chips
                .iter()
                .map(|c| wire::ChipTelemetry {
                    hwmon_path: c.hwmon_path.display().to_string(),
                    driver_name: c.driver_name.clone(),
                    chip_name: c.chip_name.clone(),
                    vendor_label: c.vendor_label.clone(),
                    vendor_class: c.vendor_class.clone(),
                })
                .collect(),
            temps: self
                .inventory
                .temps
                .iter()
                .map(|t| wire::TempTelemetry {
                    chip_path: t.chip_path.display().to_string(),
                    input_path: t.input_path.display().to_string(),
                    label: t.label.clone(),
                    temp_c: t.current_c,
                })
                .collect(),
            fans: self
                .inventory
                .fans
                .iter()
                .map(|f| wire::FanTelemetry {
                    chip_path: f.chip_path.display().to_string(),
                    input_path: f.input_path.display().to_string(),
                    label: f.label.clone(),
                    rpm: f.rpm,
                })
                .collect(),
            pwms: self
                .inventory
                .pwms
                .iter()
                .map(|p| wire::PwmTelemetry {
                    chip_path: p.chip_path.display().to_string(),
                    pwm_path: p.pwm_path.display().to_string(),
                    label: p.label.clone(),
                    pwm_max: p.pwm_max,
                    raw_value: p.raw_value,
                    percent: p.percent,
                    enable_mode: p.enable_mode,
                    rpm: p.rpm,
                })
                .collect(),
        };

        let gpus = self
            .gpu
            .samples()
            .iter()
            .map(|g| wire::GpuTelemetry {
                vendor: g.vendor.to_string(),
                name: g.name.clone(),
                index: g.index,
                pci: g.pci.clone(),
                drm: g.drm.clone(),
                hwmon: g.hwmon.clone(),
                temp_edge_c: g.temp_edge_c,
                temp_hotspot_c: g.temp_hotspot_c,
                temp_mem_c: g.temp_mem_c,
                fan_rpm: g.fan_rpm,
                fan_percent: g.fan_percent,
                has_fan_tach: g.has_fan_tach,
                has_fan_pwm: g.has_fan_pwm,
            })
            .collect();

        let detection = self
            .detection
            .as_ref()
            .map(|job| job.status())
            .or_else(|| self.detection_results.clone())
            .map(|status| wire::DetectionTelemetry {
                id: status.id,
                state: format!("{:?}", status.state).to_uppercase(),
                phase: format!("{:?}", status.phase).to_uppercase(),
                current_index: status.current_index,
                total: status.total,
            });

        TelemetrySnapshot {
            version: 1,
            timestamp_ms,
            engine_enabled: self.engine.is_enabled(),
            tick_ms: self.config.engine.tick_ms,
            delta_c: self.config.engine.delta_c,
            force_tick_ms: self.config.engine.force_tick_ms,
            profile,
            hwmon,
            gpus,
            degraded_pwms: self
                .engine
                .degraded_pwms()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            detection,
        }
    }

    /// Build a daemon around a prepared inventory and a file-backed
    /// publisher, skipping all host discovery.
    #[cfg(test)]
    pub fn test_instance(
        config: DaemonConfig,
        config_path: PathBuf,
        inventory: Inventory,
        publisher: TelemetryPublisher,
    ) -> Self {
        let engine = Engine::new(EngineTiming {
            delta_c: config.engine.delta_c,
            force_tick_ms: config.engine.force_tick_ms,
        });
        let now = Instant::now();
        Self {
            config,
            config_path,
            inventory,
            engine,
            gpu: GpuMonitor::with_drm_root(std::path::Path::new("/nonexistent/drm")),
            vendor: VendorMapWatcher::empty(),
            publisher,
            detection: None,
            detection_results: None,
            pending_profile: None,
            import_jobs: HashMap::new(),
            next_job_id: 1,
            detection_gate: Arc::new(Mutex::new(())),
            last_hwmon_refresh: now,
            last_gpu_refresh: now,
            last_publish: now,
            last_tick_check: now,
            shutdown_requested: false,
            restart_requested: false,
        }
    }

    #[cfg(test)]
    pub fn shutdown_was_requested(&self) -> (bool, bool) {
        (self.shutdown_requested, self.restart_requested)
    }

    /// Let tests reap terminal jobs without running the async loop.
    #[cfg(test)]
    pub fn poll_jobs_for_tests(&mut self) {
        self.poll_jobs();
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    fn shutdown_cleanup(&mut self) {
        info!("daemon shutting down");

        // Cancel jobs first; dropping a detection job aborts and joins it,
        // which runs its Restore phase.
        if let Some(job) = self.detection.take() {
            job.abort();
            let _ = job.join();
        }
        self.import_jobs.clear();

        // Engine-owned enable modes go back to their captured values.
        self.engine.disable();
        self.engine.restore_enable_modes();

        // One last publish so readers observe the disabled state.
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn daemon_in(dir: &TempDir) -> Daemon {
        let mut config = DaemonConfig::default();
        config.profiles.dir = dir.path().join("profiles");
        Daemon::test_instance(
            config,
            dir.path().join("daemon.json"),
            Inventory::default(),
            TelemetryPublisher::file_only(&dir.path().join("telemetry.json")),
        )
    }

    #[test]
    fn parse_error_yields_minus_32700() {
        let dir = TempDir::new().unwrap();
        let mut daemon = daemon_in(&dir);
        let response = daemon.handle_rpc_line("{not json").unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["error"]["code"], -32700);
        assert_eq!(value["id"], Value::Null);
    }

    #[test]
    fn batch_preserves_order_and_drops_notifications() {
        let dir = TempDir::new().unwrap();
        let mut daemon = daemon_in(&dir);
        let line = r#"[
            {"jsonrpc":"2.0","id":1,"method":"ping"},
            {"jsonrpc":"2.0","method":"ping"},
            {"jsonrpc":"2.0","id":2,"method":"version"}
        ]"#;
        let response = daemon.handle_rpc_line(line).unwrap();
        let values: Vec<Value> = serde_json::from_str(&response).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["id"], 1);
        assert_eq!(values[0]["result"]["data"], "pong");
        assert_eq!(values[1]["id"], 2);
    }

    #[test]
    fn notification_only_line_yields_no_response() {
        let dir = TempDir::new().unwrap();
        let mut daemon = daemon_in(&dir);
        assert!(daemon
            .handle_rpc_line(r#"{"jsonrpc":"2.0","method":"ping"}"#)
            .is_none());
    }

    #[test]
    fn empty_batch_is_invalid_request() {
        let dir = TempDir::new().unwrap();
        let mut daemon = daemon_in(&dir);
        let response = daemon.handle_rpc_line("[]").unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["error"]["code"], -32600);
    }

    #[test]
    fn success_envelope_carries_method_and_flag() {
        let dir = TempDir::new().unwrap();
        let mut daemon = daemon_in(&dir);
        let response = daemon
            .handle_rpc_line(r#"{"jsonrpc":"2.0","id":7,"method":"engine.status"}"#)
            .unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["result"]["method"], "engine.status");
        assert_eq!(value["result"]["success"], true);
        assert_eq!(value["result"]["data"]["enabled"], false);
    }

    #[test]
    fn profile_application_defers_while_suspended() {
        let dir = TempDir::new().unwrap();
        let mut daemon = daemon_in(&dir);
        daemon.engine.suspend();

        let profile = Profile::new("later");
        let applied = daemon.apply_or_defer_profile(profile).unwrap();
        assert_eq!(applied, json!({ "deferred": true }));
        assert!(daemon.pending_profile.is_some());
    }
}
