//! RPC method handlers.
//!
//! Every handler runs on the main loop with exclusive access to the daemon
//! state, so a mutation is always visible to the next request. The
//! catalogue below is the canonical method surface; `commands` is kept as a
//! deprecated alias of `rpc.commands` and routes to the same handler.

use std::process::Command;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use lfc_core::config::ConfigOverlay;
use lfc_core::engine::EngineTiming;
use lfc_core::hw::detection::{DetectionJob, DetectionState, DetectionTarget, DetectionTiming};
use lfc_core::import::{verify_mapping, ImportJob, ImportOptions};
use lfc_core::profile::{self, Profile};
use lfc_error::{rpc_code, LfcError};
use lfc_protocol::RpcErrorBody;

use crate::daemon::Daemon;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The canonical method catalogue with one-line help.
pub const METHODS: &[(&str, &str)] = &[
    ("ping", "liveness probe, returns \"pong\""),
    ("version", "daemon version"),
    ("rpc.commands", "this catalogue"),
    ("config.load", "current daemon configuration"),
    ("config.save", "persist the configuration to daemon.json"),
    ("config.set", "merge a partial configuration overlay, then persist"),
    ("hwmon.snapshot", "hwmon inventory; {rediscover:true} re-walks sysfs"),
    ("list.sensor", "temperature inputs"),
    ("list.fan", "fan tach inputs"),
    ("list.pwm", "PWM outputs"),
    ("list.profiles", "profile names in the profiles directory"),
    ("engine.enable", "enable the control engine"),
    ("engine.disable", "disable the control engine"),
    ("engine.reset", "disable, drop profile, restore PWM enable modes"),
    ("engine.status", "engine state summary"),
    ("detect.start", "start the PWM coupling sweep"),
    ("detect.abort", "abort the running sweep (Restore still runs)"),
    ("detect.status", "progress of the running or last sweep"),
    ("detect.results", "per-PWM peak RPM of the last finished sweep"),
    ("profile.list", "alias of list.profiles"),
    ("profile.getActive", "name of the active profile"),
    ("profile.setActive", "{name}: load, apply, and persist as active"),
    ("profile.load", "{name}: load a profile and apply it to the engine"),
    ("profile.save", "{profile}: validate and persist a profile document"),
    ("profile.rename", "{from,to}: rename a stored profile"),
    ("profile.delete", "{name}: delete a stored profile"),
    ("profile.import", "{path,name}: synchronous FanControl import"),
    ("profile.importAs", "{path,name,validateDetect?,rpmMin?,timeoutMs?}: start an import job"),
    ("profile.importStatus", "{jobId}: progress of an import job"),
    ("profile.importJobs", "all import jobs"),
    ("profile.importCommit", "{jobId}: persist a succeeded import and set it active"),
    ("profile.importCancel", "{jobId}: cancel a running import job"),
    ("profile.verifyMapping", "{name?,withDetect?,rpmMin?}: verify profile references"),
    ("telemetry.json", "the current telemetry snapshot"),
    ("daemon.restart", "restart the daemon process"),
    ("daemon.shutdown", "shut the daemon down"),
    ("daemon.update", "delegate to the external updater"),
];

fn err(code: i32, message: impl Into<String>) -> RpcErrorBody {
    RpcErrorBody {
        code,
        message: message.into(),
    }
}

fn from_lfc(e: LfcError) -> RpcErrorBody {
    err(e.rpc_code(), e.to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcErrorBody> {
    serde_json::to_value(value).map_err(|e| err(rpc_code::INTERNAL_ERROR, e.to_string()))
}

fn params_as<T: for<'de> Deserialize<'de>>(params: Option<&Value>) -> Result<T, RpcErrorBody> {
    // Absent params deserialize like `{}` so defaulted fields apply.
    let value = match params.cloned() {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(value) => value,
    };
    serde_json::from_value(value)
        .map_err(|e| err(rpc_code::INVALID_PARAMS, format!("invalid params: {}", e)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct NameParams {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RenameParams {
    from: String,
    to: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SnapshotParams {
    rediscover: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct JobParams {
    job_id: u64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ImportParams {
    path: String,
    name: String,
    validate_detect: bool,
    rpm_min: u32,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct VerifyParams {
    name: Option<String>,
    with_detect: bool,
    rpm_min: u32,
}

#[derive(Deserialize)]
struct SaveProfileParams {
    profile: Profile,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UpdateParams {
    target: Option<String>,
    check_only: bool,
}

impl Daemon {
    /// Route one method call. Handlers complete before the response is
    /// written, which gives RPC its read-your-writes ordering.
    pub fn dispatch(
        &mut self,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Value, RpcErrorBody> {
        match method {
            "ping" => Ok(json!("pong")),
            "version" => Ok(json!({ "version": VERSION })),
            // "commands" is the deprecated alias; one handler, one catalogue.
            "rpc.commands" | "commands" => Ok(json!(METHODS
                .iter()
                .map(|(name, help)| json!({ "method": name, "help": help }))
                .collect::<Vec<_>>())),

            "config.load" => to_value(&self.config),
            "config.save" => self.handle_config_save(),
            "config.set" => self.handle_config_set(params),

            "hwmon.snapshot" => self.handle_hwmon_snapshot(params),
            "list.sensor" => to_value(&self.inventory.temps),
            "list.fan" => to_value(&self.inventory.fans),
            "list.pwm" => to_value(&self.inventory.pwms),
            "list.profiles" | "profile.list" => {
                Ok(json!(profile::list_profiles(&self.config.profiles.dir)))
            }

            "engine.enable" => {
                self.engine.enable().map_err(from_lfc)?;
                Ok(Value::Null)
            }
            "engine.disable" => {
                self.engine.disable();
                Ok(Value::Null)
            }
            "engine.reset" => {
                self.engine.reset();
                Ok(Value::Null)
            }
            "engine.status" => to_value(&self.engine.status()),

            "detect.start" => self.handle_detect_start(),
            "detect.abort" => self.handle_detect_abort(),
            "detect.status" => self.handle_detect_status(),
            "detect.results" => self.handle_detect_results(),

            "profile.getActive" => Ok(json!({
                "name": self.config.profiles.active,
                "loaded": self.engine.profile().map(|p| p.name.clone()),
            })),
            "profile.setActive" => self.handle_profile_set_active(params),
            "profile.load" => self.handle_profile_load(params),
            "profile.save" => self.handle_profile_save(params),
            "profile.rename" => self.handle_profile_rename(params),
            "profile.delete" => self.handle_profile_delete(params),
            "profile.import" => self.handle_profile_import_sync(params),
            "profile.importAs" => self.handle_profile_import_as(params),
            "profile.importStatus" => self.handle_import_status(params),
            "profile.importJobs" => self.handle_import_jobs(),
            "profile.importCommit" => self.handle_import_commit(params),
            "profile.importCancel" => self.handle_import_cancel(params),
            "profile.verifyMapping" => self.handle_verify_mapping(params),

            "telemetry.json" => to_value(&self.telemetry_snapshot()),

            "daemon.shutdown" => {
                self.request_shutdown(false);
                Ok(json!({ "shuttingDown": true }))
            }
            "daemon.restart" => {
                self.request_shutdown(true);
                Ok(json!({ "restarting": true }))
            }
            "daemon.update" => self.handle_daemon_update(params),

            other => Err(err(
                rpc_code::METHOD_NOT_FOUND,
                format!("unknown method '{}'", other),
            )),
        }
    }

    // ========================================================================
    // Config
    // ========================================================================

    fn handle_config_save(&mut self) -> Result<Value, RpcErrorBody> {
        self.config
            .save(&self.config_path)
            .map_err(from_lfc)
            .map(|_| json!({ "path": self.config_path }))
    }

    fn handle_config_set(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let overlay: ConfigOverlay = params_as(params)?;
        self.config.merge_overlay(overlay);
        self.engine.set_timing(EngineTiming {
            delta_c: self.config.engine.delta_c,
            force_tick_ms: self.config.engine.force_tick_ms,
        });

        // The overlay is already live; a failed save is reported so the
        // caller can retry, but nothing is rolled back.
        match self.config.save(&self.config_path) {
            Ok(()) => to_value(&self.config),
            Err(e) => Err(from_lfc(e)),
        }
    }

    // ========================================================================
    // Hwmon
    // ========================================================================

    fn handle_hwmon_snapshot(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: SnapshotParams = params_as(params)?;
        if params.rediscover {
            match lfc_core::hw::discover() {
                Ok(mut inventory) => {
                    self.vendor.apply_to_inventory(&mut inventory);
                    self.inventory = inventory;
                    info!("hwmon inventory re-discovered on request");
                }
                Err(e) => {
                    return Err(err(
                        rpc_code::HWMON_UNAVAILABLE,
                        format!("hwmon inventory unavailable: {}", e),
                    ))
                }
            }
        }
        to_value(&self.inventory)
    }

    // ========================================================================
    // Detection
    // ========================================================================

    fn handle_detect_start(&mut self) -> Result<Value, RpcErrorBody> {
        if self.detection.is_some() {
            return Err(err(
                rpc_code::INVALID_PARAMS,
                "a detection job is already running",
            ));
        }
        let targets: Vec<DetectionTarget> = self
            .inventory
            .pwms
            .iter()
            .map(|pwm| DetectionTarget {
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
            .collect();
        if targets.is_empty() {
            return Err(err(rpc_code::HWMON_UNAVAILABLE, "no PWM outputs discovered"));
        }

        let id = self.allocate_job_id();
        self.engine.suspend();
        self.detection_results = None;
        self.detection = Some(DetectionJob::start(id, targets, DetectionTiming::default()));
        Ok(json!({ "jobId": id }))
    }

    fn handle_detect_abort(&mut self) -> Result<Value, RpcErrorBody> {
        match &self.detection {
            Some(job) => {
                job.abort();
                Ok(Value::Null)
            }
            None => Err(err(rpc_code::IMPORT_JOB_NOT_FOUND, "no detection job running")),
        }
    }

    fn handle_detect_status(&mut self) -> Result<Value, RpcErrorBody> {
        if let Some(job) = &self.detection {
            return to_value(&job.status());
        }
        if let Some(results) = &self.detection_results {
            return to_value(results);
        }
        Ok(json!({ "state": DetectionState::Idle }))
    }

    fn handle_detect_results(&mut self) -> Result<Value, RpcErrorBody> {
        match &self.detection_results {
            Some(results) => to_value(&results.per_pwm_peak_rpm),
            None => Err(err(
                rpc_code::IMPORT_JOB_NOT_FOUND,
                "no finished detection results",
            )),
        }
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    fn handle_profile_set_active(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: NameParams = params_as(params)?;
        let loaded =
            profile::load_from_dir(&self.config.profiles.dir, &params.name).map_err(from_lfc)?;
        let applied = self
            .apply_or_defer_profile(loaded)
            .map_err(|e| err(rpc_code::INTERNAL_ERROR, e))?;

        self.config.profiles.active = Some(params.name.clone());
        self.config.save(&self.config_path).map_err(from_lfc)?;
        Ok(json!({ "name": params.name, "applied": applied }))
    }

    fn handle_profile_load(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: NameParams = params_as(params)?;
        let loaded =
            profile::load_from_dir(&self.config.profiles.dir, &params.name).map_err(from_lfc)?;
        self.apply_or_defer_profile(loaded)
            .map_err(|e| err(rpc_code::INTERNAL_ERROR, e))
    }

    fn handle_profile_save(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: SaveProfileParams = params_as(params)?;
        let report = profile::validate_structure(&params.profile);
        if !report.ok {
            return Err(err(
                rpc_code::INVALID_PARAMS,
                format!("profile rejected: {}", report.errors.join("; ")),
            ));
        }
        let path =
            profile::save_to_dir(&params.profile, &self.config.profiles.dir).map_err(from_lfc)?;
        Ok(json!({ "path": path, "warnings": report.warnings }))
    }

    fn handle_profile_rename(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: RenameParams = params_as(params)?;
        let renamed = profile::rename_profile(&self.config.profiles.dir, &params.from, &params.to)
            .map_err(from_lfc)?;
        if self.config.profiles.active.as_deref() == Some(params.from.as_str()) {
            self.config.profiles.active = Some(params.to.clone());
            if let Err(e) = self.config.save(&self.config_path) {
                warn!(error = %e, "config save after rename failed");
            }
        }
        Ok(json!({ "name": renamed.name }))
    }

    fn handle_profile_delete(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: NameParams = params_as(params)?;
        profile::delete_profile(&self.config.profiles.dir, &params.name).map_err(from_lfc)?;
        if self.config.profiles.active.as_deref() == Some(params.name.as_str()) {
            self.config.profiles.active = None;
            if let Err(e) = self.config.save(&self.config_path) {
                warn!(error = %e, "config save after delete failed");
            }
        }
        Ok(Value::Null)
    }

    /// Synchronous import: parse, map, validate, persist, apply.
    fn handle_profile_import_sync(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: ImportParams = params_as(params)?;
        let text = std::fs::read_to_string(lfc_core::config::expand_tilde(&params.path))
            .map_err(|e| err(rpc_code::INVALID_PARAMS, format!("{}: {}", params.path, e)))?;
        let controls = lfc_core::import::parse_legacy(&text).map_err(from_lfc)?;

        let vendor_map = self.vendor.map();
        let vendor_guard = vendor_map.read();
        let outcome = lfc_core::import::map_controls(
            &params.name,
            &controls,
            &self.inventory,
            Some(&*vendor_guard),
        )
        .map_err(from_lfc)?;
        drop(vendor_guard);

        let report = profile::validate_against_inventory(&outcome.profile, &self.inventory);
        if !report.ok {
            return Err(err(
                rpc_code::INVALID_PARAMS,
                format!("validation failed: {}", report.errors.join("; ")),
            ));
        }

        profile::save_to_dir(&outcome.profile, &self.config.profiles.dir).map_err(from_lfc)?;
        let applied = self
            .apply_or_defer_profile(outcome.profile)
            .map_err(|e| err(rpc_code::INTERNAL_ERROR, e))?;
        Ok(json!({
            "name": params.name,
            "warnings": outcome.warnings,
            "applied": applied,
        }))
    }

    fn handle_profile_import_as(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: ImportParams = params_as(params)?;
        if params.path.is_empty() || params.name.is_empty() {
            return Err(err(rpc_code::INVALID_PARAMS, "path and name are required"));
        }

        let id = self.allocate_job_id();
        let options = ImportOptions {
            validate_detect: params.validate_detect,
            rpm_min: params.rpm_min,
            timeout_ms: params.timeout_ms,
            detection_timing: DetectionTiming::default(),
        };
        let job = ImportJob::start(
            id,
            lfc_core::config::expand_tilde(&params.path),
            params.name,
            self.inventory.clone(),
            Some(self.vendor.map()),
            options,
            self.detection_gate.clone(),
        );
        self.import_jobs.insert(id, job);
        Ok(json!({ "jobId": id }))
    }

    fn handle_import_status(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: JobParams = params_as(params)?;
        match self.import_jobs.get(&params.job_id) {
            Some(job) => to_value(&job.status()),
            None => Err(err(
                rpc_code::IMPORT_JOB_NOT_FOUND,
                format!("import job {} not found", params.job_id),
            )),
        }
    }

    fn handle_import_jobs(&mut self) -> Result<Value, RpcErrorBody> {
        let mut statuses: Vec<_> = self.import_jobs.values().map(|job| job.status()).collect();
        statuses.sort_by_key(|status| status.id);
        to_value(&statuses)
    }

    fn handle_import_commit(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: JobParams = params_as(params)?;
        let job = self.import_jobs.get(&params.job_id).ok_or_else(|| {
            err(
                rpc_code::IMPORT_JOB_NOT_FOUND,
                format!("import job {} not found", params.job_id),
            )
        })?;

        let profile = job.take_result().map_err(from_lfc)?;
        let name = profile.name.clone();
        profile::save_to_dir(&profile, &self.config.profiles.dir)
            .map_err(|e| err(rpc_code::IMPORT_COMMIT_FAILED, e.to_string()))?;

        let applied = self
            .apply_or_defer_profile(profile)
            .map_err(|e| err(rpc_code::IMPORT_COMMIT_FAILED, e))?;
        self.config.profiles.active = Some(name.clone());
        if let Err(e) = self.config.save(&self.config_path) {
            warn!(error = %e, "config save after import commit failed");
        }
        Ok(json!({ "name": name, "applied": applied }))
    }

    fn handle_import_cancel(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: JobParams = params_as(params)?;
        match self.import_jobs.get(&params.job_id) {
            Some(job) => {
                job.cancel().map_err(from_lfc)?;
                Ok(Value::Null)
            }
            None => Err(err(
                rpc_code::IMPORT_JOB_NOT_FOUND,
                format!("import job {} not found", params.job_id),
            )),
        }
    }

    fn handle_verify_mapping(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: VerifyParams = params_as(params)?;
        let profile = match &params.name {
            Some(name) => {
                profile::load_from_dir(&self.config.profiles.dir, name).map_err(from_lfc)?
            }
            None => match self.engine.profile() {
                Some(profile) => (*profile).clone(),
                None => {
                    return Err(err(rpc_code::PROFILE_NOT_FOUND, "no profile loaded"));
                }
            },
        };

        // A detect run drives the PWMs; hold the gate and keep the engine
        // out of the way for the duration of this synchronous handler.
        let report = if params.with_detect {
            let _gate = self.detection_gate.lock();
            let was_suspended = self.engine.is_suspended();
            self.engine.suspend();
            let report = verify_mapping(
                &profile,
                &self.inventory,
                true,
                params.rpm_min,
                DetectionTiming::default(),
            );
            if !was_suspended {
                self.engine.resume();
            }
            report
        } else {
            verify_mapping(
                &profile,
                &self.inventory,
                false,
                params.rpm_min,
                DetectionTiming::default(),
            )
        };
        to_value(&report)
    }

    // ========================================================================
    // Update delegation
    // ========================================================================

    /// The release downloader is an external collaborator; this handler
    /// only delegates to it.
    fn handle_daemon_update(&mut self, params: Option<&Value>) -> Result<Value, RpcErrorBody> {
        let params: UpdateParams = params_as(params)?;
        let mut command = Command::new("lfcd-update");
        if params.check_only {
            command.arg("--check");
        }
        if let Some(target) = &params.target {
            command.args(["--target", target]);
        }
        match command.output() {
            Ok(output) if output.status.success() => Ok(json!({
                "output": String::from_utf8_lossy(&output.stdout).trim(),
            })),
            Ok(output) => Err(err(
                rpc_code::UPDATE_FETCH_FAILED,
                format!(
                    "updater exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
            Err(e) => Err(err(
                rpc_code::UPDATE_FETCH_FAILED,
                format!("updater not available: {}", e),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryPublisher;
    use lfc_core::config::DaemonConfig;
    use lfc_core::hw::discover_at;
    use lfc_core::hw::inventory::test_support::{write_chip, FakeChip};
    use lfc_core::profile::{CurvePoint, Rule, Source, SourceSettings};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        chip: PathBuf,
        daemon: Daemon,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let chip = write_chip(
            &dir.path().join("hwmon"),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "CPUTIN", 45000)],
                fans: &[(1, 900)],
                pwms: &[(1, 60, Some(5))],
            },
        );
        let inventory = discover_at(&dir.path().join("hwmon")).unwrap();

        let mut config = DaemonConfig::default();
        config.profiles.dir = dir.path().join("profiles");

        let daemon = Daemon::test_instance(
            config,
            dir.path().join("daemon.json"),
            inventory,
            TelemetryPublisher::file_only(&dir.path().join("telemetry.json")),
        );
        Fixture {
            chip,
            daemon,
            _dir: dir,
        }
    }

    fn profile_for(chip: &std::path::Path, name: &str) -> Profile {
        let mut profile = Profile::new(name);
        profile.rules.push(Rule {
            pwm_path: chip.join("pwm1"),
            nickname: None,
            sources: vec![Source {
                temp_paths: vec![chip.join("temp1_input")],
                points: vec![
                    CurvePoint { temp_c: 30.0, percent: 20.0 },
                    CurvePoint { temp_c: 60.0, percent: 80.0 },
                ],
                settings: SourceSettings::default(),
            }],
        });
        profile
    }

    #[test]
    fn commands_alias_matches_canonical() {
        let mut f = fixture();
        let canonical = f.daemon.dispatch("rpc.commands", None).unwrap();
        let alias = f.daemon.dispatch("commands", None).unwrap();
        assert_eq!(canonical, alias);
        assert_eq!(canonical.as_array().unwrap().len(), METHODS.len());
    }

    #[test]
    fn unknown_method_is_minus_32601() {
        let mut f = fixture();
        let error = f.daemon.dispatch("engine.warp", None).unwrap_err();
        assert_eq!(error.code, rpc_code::METHOD_NOT_FOUND);
    }

    #[test]
    fn profile_save_load_roundtrip_through_rpc() {
        let mut f = fixture();
        let profile = profile_for(&f.chip, "quiet");
        let params = json!({ "profile": profile });
        f.daemon.dispatch("profile.save", Some(&params)).unwrap();

        let listed = f.daemon.dispatch("list.profiles", None).unwrap();
        assert_eq!(listed, json!(["quiet"]));

        let applied = f
            .daemon
            .dispatch("profile.load", Some(&json!({ "name": "quiet" })))
            .unwrap();
        assert_eq!(applied["deferred"], false);
        assert_eq!(applied["enabled"], true);
        assert!(f.daemon.engine.is_enabled());
    }

    #[test]
    fn set_active_persists_config() {
        let mut f = fixture();
        let params = json!({ "profile": profile_for(&f.chip, "day") });
        f.daemon.dispatch("profile.save", Some(&params)).unwrap();
        f.daemon
            .dispatch("profile.setActive", Some(&json!({ "name": "day" })))
            .unwrap();

        assert_eq!(f.daemon.config.profiles.active.as_deref(), Some("day"));
        // config.save was called; resolve reads it back.
        let reloaded = DaemonConfig::resolve(Some(&f.daemon.config_path)).unwrap();
        assert_eq!(reloaded.profiles.active.as_deref(), Some("day"));
    }

    #[test]
    fn missing_profile_is_minus_32004() {
        let mut f = fixture();
        let error = f
            .daemon
            .dispatch("profile.load", Some(&json!({ "name": "ghost" })))
            .unwrap_err();
        assert_eq!(error.code, rpc_code::PROFILE_NOT_FOUND);
    }

    #[test]
    fn import_job_lifecycle_through_rpc() {
        let mut f = fixture();
        let source = f._dir.path().join("legacy.json");
        std::fs::write(
            &source,
            r#"{"Controls": [{"FanId": "/lpc/nct6799d/0/control/0",
                "Sensor": "CPUTIN", "SpeedCurve": [[30, 20], [60, 80]]}]}"#,
        )
        .unwrap();

        let started = f
            .daemon
            .dispatch(
                "profile.importAs",
                Some(&json!({ "path": source, "name": "imported" })),
            )
            .unwrap();
        let job_id = started["jobId"].as_u64().unwrap();

        // The worker is a real thread; wait for the terminal state.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = f
                .daemon
                .dispatch("profile.importStatus", Some(&json!({ "jobId": job_id })))
                .unwrap();
            if status["state"] == "SUCCEEDED" {
                break;
            }
            assert_ne!(status["state"], "FAILED", "{:?}", status);
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        // Nothing persisted before the commit step.
        assert_eq!(f.daemon.dispatch("list.profiles", None).unwrap(), json!([]));

        let committed = f
            .daemon
            .dispatch("profile.importCommit", Some(&json!({ "jobId": job_id })))
            .unwrap();
        assert_eq!(committed["name"], "imported");
        assert_eq!(
            f.daemon.dispatch("list.profiles", None).unwrap(),
            json!(["imported"])
        );
        assert_eq!(
            f.daemon.config.profiles.active.as_deref(),
            Some("imported")
        );

        // A second commit fails; cancel on the terminal job is -32032.
        let error = f
            .daemon
            .dispatch("profile.importCommit", Some(&json!({ "jobId": job_id })))
            .unwrap_err();
        assert_eq!(error.code, rpc_code::IMPORT_COMMIT_FAILED);
        let error = f
            .daemon
            .dispatch("profile.importCancel", Some(&json!({ "jobId": job_id })))
            .unwrap_err();
        assert_eq!(error.code, rpc_code::IMPORT_JOB_NOT_CANCELABLE);
    }

    #[test]
    fn failed_import_writes_no_file() {
        let mut f = fixture();
        let source = f._dir.path().join("legacy.json");
        std::fs::write(
            &source,
            // Tctl does not exist in this inventory.
            r#"{"Controls": [{"FanId": "/lpc/nct6799d/0/control/0",
                "Sensor": "Tctl", "SpeedCurve": [[30, 20]]}]}"#,
        )
        .unwrap();

        let started = f
            .daemon
            .dispatch(
                "profile.importAs",
                Some(&json!({ "path": source, "name": "broken" })),
            )
            .unwrap();
        let job_id = started["jobId"].as_u64().unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let status = f
                .daemon
                .dispatch("profile.importStatus", Some(&json!({ "jobId": job_id })))
                .unwrap();
            if status["state"] == "FAILED" {
                break;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        assert!(!f.daemon.config.profiles.dir.join("broken.json").exists());
        let error = f
            .daemon
            .dispatch("profile.importCommit", Some(&json!({ "jobId": job_id })))
            .unwrap_err();
        assert_eq!(error.code, rpc_code::IMPORT_COMMIT_FAILED);
    }

    #[test]
    fn detection_defers_profile_application() {
        let mut f = fixture();
        let params = json!({ "profile": profile_for(&f.chip, "deferred") });
        f.daemon.dispatch("profile.save", Some(&params)).unwrap();

        let started = f.daemon.dispatch("detect.start", None).unwrap();
        assert!(started["jobId"].as_u64().is_some());
        assert!(f.daemon.engine.is_suspended());

        // profile.load is accepted but only queued while detection runs.
        let applied = f
            .daemon
            .dispatch("profile.load", Some(&json!({ "name": "deferred" })))
            .unwrap();
        assert_eq!(applied["deferred"], true);
        assert!(!f.daemon.engine.is_enabled());

        // Sweep finishes (default settle is seconds; abort shortens it and
        // Restore still runs), then the pending profile lands.
        f.daemon.dispatch("detect.abort", None).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while f.daemon.detection.is_some() {
            f.daemon.poll_jobs_for_tests();
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!f.daemon.engine.is_suspended());
        assert!(f.daemon.engine.is_enabled());
        assert_eq!(
            f.daemon.engine.profile().unwrap().name.as_str(),
            "deferred"
        );
    }

    #[test]
    fn config_set_applies_and_persists() {
        let mut f = fixture();
        let updated = f
            .daemon
            .dispatch(
                "config.set",
                Some(&json!({ "engine": { "deltaC": 1.2, "forceTickMs": 3000 } })),
            )
            .unwrap();
        assert_eq!(updated["engine"]["deltaC"], 1.2);
        assert_eq!(f.daemon.engine.timing().force_tick_ms, 3000);
        assert!(f.daemon.config_path.exists());
    }

    #[test]
    fn telemetry_json_reflects_inventory() {
        let mut f = fixture();
        let snapshot = f.daemon.dispatch("telemetry.json", None).unwrap();
        assert_eq!(snapshot["hwmon"]["temps"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["hwmon"]["pwms"][0]["percent"], 24);
        assert_eq!(snapshot["engineEnabled"], false);
    }

    #[test]
    fn shutdown_and_restart_flags() {
        let mut f = fixture();
        f.daemon.dispatch("daemon.shutdown", None).unwrap();
        assert_eq!(f.daemon.shutdown_was_requested(), (true, false));

        let mut f = fixture();
        f.daemon.dispatch("daemon.restart", None).unwrap();
        assert_eq!(f.daemon.shutdown_was_requested(), (true, true));
    }
}
