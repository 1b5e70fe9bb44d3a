//! Control engine: turns temperatures into PWM duty on each tick.
//!
//! The engine owns the active profile, the per-source hysteresis and
//! smoothing state, the spin-up windows, and the per-PWM failure counters.
//! It borrows hardware by path through the inventory - never by pointer -
//! so an inventory reload cannot invalidate a profile.
//!
//! Ticks are gated: the daemon calls `needs_tick` and only runs `tick`
//! when a referenced temperature moved by at least `delta_c` since the last
//! evaluation or `force_tick_ms` elapsed. Gating applies to evaluation
//! only; the smoothing integral always uses real elapsed time.

pub mod curve;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lfc_error::{LfcError, Result};

use crate::constants::pwm as pwm_const;
use crate::hw::access::{self, EnableRestore};
use crate::hw::Inventory;
use crate::profile::{validate_against_inventory, Profile, ValidationReport};
use curve::SourceState;

/// Engine timing knobs owned by the daemon config.
#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    pub delta_c: f64,
    pub force_tick_ms: u64,
}

/// Status summary exposed over RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub enabled: bool,
    pub suspended: bool,
    pub profile_name: Option<String>,
    pub profile_valid: bool,
    pub rule_count: usize,
    pub degraded_pwms: Vec<String>,
}

pub struct Engine {
    enabled: bool,
    /// Set while a detection job drives the PWMs
    suspended: bool,
    timing: EngineTiming,
    profile: Option<Arc<Profile>>,
    profile_valid: bool,
    last_outputs: HashMap<PathBuf, u8>,
    /// Last attempted percent per PWM, kept across failures so a degraded
    /// output is only re-tried when the engine wants a different value
    last_attempts: HashMap<PathBuf, u8>,
    last_temp_snapshot: HashMap<PathBuf, f64>,
    source_states: HashMap<(usize, usize), SourceState>,
    spinup_until: HashMap<PathBuf, Instant>,
    failure_counts: HashMap<PathBuf, u32>,
    /// PWMs and rules already logged once for their current failure state
    logged_degraded: HashSet<PathBuf>,
    logged_skipped_rules: HashSet<PathBuf>,
    /// Captured pre-manual enable modes, restored on reset/shutdown
    enable_guards: HashMap<PathBuf, Option<EnableRestore>>,
    last_tick: Option<Instant>,
}

impl Engine {
    pub fn new(timing: EngineTiming) -> Self {
        Self {
            enabled: false,
            suspended: false,
            timing,
            profile: None,
            profile_valid: false,
            last_outputs: HashMap::new(),
            last_attempts: HashMap::new(),
            last_temp_snapshot: HashMap::new(),
            source_states: HashMap::new(),
            spinup_until: HashMap::new(),
            failure_counts: HashMap::new(),
            logged_degraded: HashSet::new(),
            logged_skipped_rules: HashSet::new(),
            enable_guards: HashMap::new(),
            last_tick: None,
        }
    }

    pub fn timing(&self) -> EngineTiming {
        self.timing
    }

    pub fn set_timing(&mut self, timing: EngineTiming) {
        self.timing = timing;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn profile(&self) -> Option<Arc<Profile>> {
        self.profile.clone()
    }

    pub fn profile_valid(&self) -> bool {
        self.profile_valid
    }

    /// Suspend ticking while a detection job owns the PWMs.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
        // Detection moved the fans; force a fresh evaluation baseline.
        self.last_temp_snapshot.clear();
        self.last_outputs.clear();
    }

    /// Replace the active profile atomically.
    ///
    /// Referential integrity is validated against the inventory; the report
    /// is returned either way. The profile is stored even when invalid, but
    /// the engine stays disabled until explicitly enabled, and `enable`
    /// refuses an invalid profile.
    pub fn apply_profile(&mut self, profile: Profile, inventory: &Inventory) -> ValidationReport {
        let report = validate_against_inventory(&profile, inventory);
        info!(
            profile = %profile.name,
            valid = report.ok,
            warnings = report.warnings.len(),
            "applying profile"
        );

        self.profile = Some(Arc::new(profile));
        self.profile_valid = report.ok;
        self.enabled = false;
        self.last_outputs.clear();
        self.last_attempts.clear();
        self.last_temp_snapshot.clear();
        self.source_states.clear();
        self.spinup_until.clear();
        self.failure_counts.clear();
        self.logged_degraded.clear();
        self.logged_skipped_rules.clear();
        report
    }

    pub fn enable(&mut self) -> Result<()> {
        let Some(profile) = &self.profile else {
            return Err(LfcError::ValidationFailed("no profile loaded".to_string()));
        };
        if !self.profile_valid {
            return Err(LfcError::ValidationFailed(format!(
                "profile '{}' references hardware not present in the inventory",
                profile.name
            )));
        }
        self.enabled = true;
        info!(profile = %profile.name, "engine enabled");
        Ok(())
    }

    pub fn disable(&mut self) {
        if self.enabled {
            info!("engine disabled");
        }
        self.enabled = false;
    }

    /// Disable, drop the profile, and restore captured enable modes.
    pub fn reset(&mut self) {
        self.disable();
        self.profile = None;
        self.profile_valid = false;
        self.last_outputs.clear();
        self.last_attempts.clear();
        self.last_temp_snapshot.clear();
        self.source_states.clear();
        self.spinup_until.clear();
        self.failure_counts.clear();
        self.restore_enable_modes();
        info!("engine reset");
    }

    /// Write back every captured pre-manual enable mode.
    pub fn restore_enable_modes(&mut self) {
        for (path, guard) in self.enable_guards.drain() {
            if let Some(guard) = guard {
                if let Err(e) = guard.restore() {
                    warn!(pwm = ?path, error = %e, "enable mode restore failed");
                }
            }
        }
    }

    pub fn degraded_pwms(&self) -> Vec<PathBuf> {
        self.failure_counts
            .iter()
            .filter(|(_, count)| **count >= pwm_const::DEGRADE_THRESHOLD)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            enabled: self.enabled,
            suspended: self.suspended,
            profile_name: self.profile.as_ref().map(|p| p.name.clone()),
            profile_valid: self.profile_valid,
            rule_count: self.profile.as_ref().map(|p| p.rules.len()).unwrap_or(0),
            degraded_pwms: self
                .degraded_pwms()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        }
    }

    /// Decide whether a tick is due.
    ///
    /// True when any referenced temperature moved by at least `delta_c`
    /// since the last evaluation, or `force_tick_ms` elapsed. Never true
    /// while disabled or suspended.
    pub fn needs_tick(&self, inventory: &Inventory, now: Instant) -> bool {
        if !self.enabled || self.suspended || !self.profile_valid {
            return false;
        }
        let Some(profile) = &self.profile else {
            return false;
        };

        let Some(last_tick) = self.last_tick else {
            return true;
        };
        if now.duration_since(last_tick) >= Duration::from_millis(self.timing.force_tick_ms) {
            return true;
        }

        for temp_path in profile.referenced_temp_paths() {
            let Some(current) = inventory
                .temp_by_path(temp_path)
                .and_then(|t| t.current_c)
            else {
                continue;
            };
            match self.last_temp_snapshot.get(temp_path.as_path()) {
                Some(previous) => {
                    if (current - previous).abs() >= self.timing.delta_c {
                        return true;
                    }
                }
                None => return true,
            }
        }
        false
    }

    /// Evaluate every rule and write changed PWMs.
    ///
    /// Returns the set of PWM paths actually written. Written values are
    /// reflected back into the inventory so the telemetry publish that
    /// follows observes the post-tick state.
    pub fn tick(&mut self, inventory: &mut Inventory, now: Instant) -> Vec<PathBuf> {
        let Some(profile) = self.profile.clone() else {
            return Vec::new();
        };
        if !self.enabled || self.suspended {
            return Vec::new();
        }

        let dt = self
            .last_tick
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO);
        let mut changed = Vec::new();

        for (rule_index, rule) in profile.rules.iter().enumerate() {
            if let Some(percent) = self.evaluate_rule(rule_index, rule, inventory, now, dt) {
                if self.commit_output(rule, percent, inventory) {
                    changed.push(rule.pwm_path.clone());
                }
            }
        }

        // Record the evaluated temperatures for the next delta comparison.
        for temp_path in profile.referenced_temp_paths() {
            if let Some(current) = inventory.temp_by_path(temp_path).and_then(|t| t.current_c) {
                self.last_temp_snapshot.insert(temp_path.clone(), current);
            }
        }
        self.last_tick = Some(now);
        changed
    }

    /// Steps 1-8 of rule evaluation; returns the final integer percent.
    fn evaluate_rule(
        &mut self,
        rule_index: usize,
        rule: &crate::profile::Rule,
        inventory: &Inventory,
        now: Instant,
        dt: Duration,
    ) -> Option<u8> {
        let mut per_source: Vec<f64> = Vec::with_capacity(rule.sources.len());

        for (source_index, source) in rule.sources.iter().enumerate() {
            let temps: Vec<f64> = source
                .temp_paths
                .iter()
                .filter_map(|p| inventory.temp_by_path(p).and_then(|t| t.current_c))
                .collect();
            let Some(reduced) = source.settings.mix_function.reduce(&temps) else {
                continue;
            };

            let state = self
                .source_states
                .entry((rule_index, source_index))
                .or_default();
            per_source.push(state.evaluate(&source.points, &source.settings, reduced, dt));
        }

        // Rule-level settings come from the leading source.
        let settings = &rule.sources.first()?.settings;

        let Some(mixed) = settings.mix_function.reduce(&per_source) else {
            if self.logged_skipped_rules.insert(rule.pwm_path.clone()) {
                warn!(pwm = ?rule.pwm_path, "no temperature source available, rule skipped");
            }
            return None;
        };
        self.logged_skipped_rules.remove(&rule.pwm_path);

        let mut percent = mixed.clamp(settings.min_percent, settings.max_percent);

        // Spin-up: a stopped fan gets a burst before settling to the target.
        if let (Some(spinup_percent), Some(duration_ms)) =
            (settings.spinup_percent, settings.spinup_duration_ms)
        {
            if let Some(until) = self.spinup_until.get(&rule.pwm_path) {
                if now < *until {
                    percent = spinup_percent;
                } else {
                    self.spinup_until.remove(&rule.pwm_path);
                }
            } else {
                let rpm = inventory.pwm_by_path(&rule.pwm_path).and_then(|p| p.rpm);
                if rpm == Some(0) && percent > 0.0 {
                    self.spinup_until
                        .insert(rule.pwm_path.clone(), now + Duration::from_millis(duration_ms));
                    percent = spinup_percent;
                }
            }
        }

        Some(percent.round().clamp(0.0, 100.0) as u8)
    }

    /// Step 9: write on integer-percent change, with degradation tracking.
    fn commit_output(
        &mut self,
        rule: &crate::profile::Rule,
        percent: u8,
        inventory: &mut Inventory,
    ) -> bool {
        if self.last_outputs.get(&rule.pwm_path) == Some(&percent) {
            return false;
        }

        let failures = self.failure_counts.get(&rule.pwm_path).copied().unwrap_or(0);
        if failures >= pwm_const::DEGRADE_THRESHOLD {
            // Degraded: no periodic probing, only a genuinely new target
            // counts as the natural re-try.
            if self.last_attempts.get(&rule.pwm_path) == Some(&percent) {
                return false;
            }
        }

        let Some(pwm_out) = inventory.pwm_by_path(&rule.pwm_path) else {
            return false;
        };
        let pwm_max = pwm_out.pwm_max;
        let enable_path = pwm_out.enable_path.clone();
        let raw = pwm_const::from_percent(percent as f64, pwm_max);

        // First manual transition captures the prior enable mode.
        if let Some(enable_path) = enable_path {
            self.enable_guards
                .entry(rule.pwm_path.clone())
                .or_insert_with(|| match EnableRestore::acquire(&enable_path) {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(path = ?enable_path, error = %e, "manual enable failed");
                        None
                    }
                });
        }

        self.last_attempts.insert(rule.pwm_path.clone(), percent);
        match access::write_pwm_raw(&rule.pwm_path, raw, pwm_max) {
            Ok(()) => {
                self.failure_counts.insert(rule.pwm_path.clone(), 0);
                self.logged_degraded.remove(&rule.pwm_path);
                self.last_outputs.insert(rule.pwm_path.clone(), percent);
                if let Some(pwm_out) = inventory.pwm_by_path_mut(&rule.pwm_path) {
                    pwm_out.raw_value = Some(raw);
                    pwm_out.percent = Some(percent);
                }
                debug!(pwm = ?rule.pwm_path, percent, raw, "PWM written");
                true
            }
            Err(e) => {
                let count = failures + 1;
                self.failure_counts.insert(rule.pwm_path.clone(), count);
                if count >= pwm_const::DEGRADE_THRESHOLD
                    && self.logged_degraded.insert(rule.pwm_path.clone())
                {
                    warn!(pwm = ?rule.pwm_path, error = %e, "PWM degraded after {} failures", count);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::inventory::test_support::{write_chip, FakeChip};
    use crate::hw::{discover_at, refresh_values};
    use crate::profile::{CurvePoint, Rule, Source, SourceSettings};
    use std::fs;
    use tempfile::TempDir;

    fn timing() -> EngineTiming {
        EngineTiming {
            delta_c: 0.5,
            force_tick_ms: 2000,
        }
    }

    fn linear_profile(chip: &std::path::Path, settings: SourceSettings) -> Profile {
        let mut profile = Profile::new("test");
        profile.rules.push(Rule {
            pwm_path: chip.join("pwm1"),
            nickname: None,
            sources: vec![Source {
                temp_paths: vec![chip.join("temp1_input")],
                points: vec![
                    CurvePoint { temp_c: 30.0, percent: 20.0 },
                    CurvePoint { temp_c: 60.0, percent: 80.0 },
                ],
                settings,
            }],
        });
        profile
    }

    fn setup(temp_millidegrees: i64, fan_rpm: u32) -> (TempDir, std::path::PathBuf, Inventory) {
        let dir = TempDir::new().unwrap();
        let chip = write_chip(
            dir.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "CPUTIN", temp_millidegrees)],
                fans: &[(1, fan_rpm)],
                pwms: &[(1, 0, Some(5))],
            },
        );
        let inventory = discover_at(dir.path()).unwrap();
        (dir, chip, inventory)
    }

    #[test]
    fn enable_requires_valid_profile() {
        let (_dir, chip, inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        assert!(engine.enable().is_err());

        let mut bad = linear_profile(&chip, SourceSettings::default());
        bad.rules[0].pwm_path = chip.join("pwm9");
        let report = engine.apply_profile(bad, &inventory);
        assert!(!report.ok);
        assert!(engine.enable().is_err());

        let report = engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        assert!(report.ok);
        assert!(!engine.is_enabled()); // apply never auto-enables
        engine.enable().unwrap();
        assert!(engine.is_enabled());
    }

    #[test]
    fn tick_writes_curve_output_and_sets_manual() {
        let (_dir, chip, mut inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        engine.enable().unwrap();

        let changed = engine.tick(&mut inventory, Instant::now());
        assert_eq!(changed, vec![chip.join("pwm1")]);
        // 45 degC on a 30->20 / 60->80 curve is 50%.
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap(), "128");
        assert_eq!(fs::read_to_string(chip.join("pwm1_enable")).unwrap(), "1");
        assert_eq!(inventory.pwm_by_path(&chip.join("pwm1")).unwrap().percent, Some(50));
    }

    #[test]
    fn consecutive_identical_ticks_write_nothing() {
        let (_dir, chip, mut inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        engine.enable().unwrap();

        let now = Instant::now();
        assert_eq!(engine.tick(&mut inventory, now).len(), 1);
        assert!(engine
            .tick(&mut inventory, now + Duration::from_millis(50))
            .is_empty());
    }

    #[test]
    fn delta_gating_with_forced_tick() {
        let (_dir, chip, mut inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        engine.enable().unwrap();

        let t0 = Instant::now();
        assert!(engine.needs_tick(&inventory, t0)); // first tick always due
        engine.tick(&mut inventory, t0);

        // Oscillation inside the delta band never triggers.
        fs::write(chip.join("temp1_input"), "45300\n").unwrap();
        refresh_values(&mut inventory);
        assert!(!engine.needs_tick(&inventory, t0 + Duration::from_millis(500)));

        // The forced cadence still fires.
        assert!(engine.needs_tick(&inventory, t0 + Duration::from_millis(2000)));

        // A full delta move triggers before the forced cadence.
        fs::write(chip.join("temp1_input"), "45900\n").unwrap();
        refresh_values(&mut inventory);
        assert!(engine.needs_tick(&inventory, t0 + Duration::from_millis(600)));
    }

    #[test]
    fn spinup_burst_then_target() {
        let (_dir, chip, mut inventory) = setup(45_000, 0);
        let settings = SourceSettings {
            spinup_percent: Some(80.0),
            spinup_duration_ms: Some(1500),
            ..SourceSettings::default()
        };
        // Flat 40% curve.
        let mut profile = linear_profile(&chip, settings);
        profile.rules[0].sources[0].points = vec![
            CurvePoint { temp_c: 0.0, percent: 40.0 },
            CurvePoint { temp_c: 100.0, percent: 40.0 },
        ];

        let mut engine = Engine::new(timing());
        engine.apply_profile(profile, &inventory);
        engine.enable().unwrap();

        let t0 = Instant::now();
        engine.tick(&mut inventory, t0);
        // Stopped fan: burst at 80% (raw 204).
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap(), "204");

        // Window over: back to the 40% target.
        engine.tick(&mut inventory, t0 + Duration::from_millis(1600));
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap(), "102");
    }

    #[test]
    fn reset_restores_enable_mode() {
        let (_dir, chip, mut inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        engine.enable().unwrap();
        engine.tick(&mut inventory, Instant::now());
        assert_eq!(fs::read_to_string(chip.join("pwm1_enable")).unwrap(), "1");

        engine.reset();
        assert_eq!(fs::read_to_string(chip.join("pwm1_enable")).unwrap(), "5");
        assert!(engine.profile().is_none());
        assert!(!engine.is_enabled());
    }

    #[test]
    fn write_failures_degrade_then_natural_retry() {
        let (_dir, chip, mut inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        engine.enable().unwrap();

        // Replace the PWM file with a directory so writes fail.
        fs::remove_file(chip.join("pwm1")).unwrap();
        fs::create_dir(chip.join("pwm1")).unwrap();

        let t0 = Instant::now();
        for i in 0..3 {
            let changed = engine.tick(&mut inventory, t0 + Duration::from_millis(50 * i));
            assert!(changed.is_empty());
        }
        assert_eq!(engine.degraded_pwms(), vec![chip.join("pwm1")]);

        // Same target again: degraded PWM is skipped, counter stays put.
        engine.tick(&mut inventory, t0 + Duration::from_millis(200));
        assert_eq!(engine.degraded_pwms().len(), 1);

        // A new target is the natural re-try; a successful write recovers.
        fs::remove_dir(chip.join("pwm1")).unwrap();
        fs::write(chip.join("pwm1"), "0").unwrap();
        fs::write(chip.join("temp1_input"), "60000\n").unwrap();
        refresh_values(&mut inventory);
        let changed = engine.tick(&mut inventory, t0 + Duration::from_millis(300));
        assert_eq!(changed.len(), 1);
        assert!(engine.degraded_pwms().is_empty());
    }

    #[test]
    fn unavailable_temp_skips_rule_without_crash() {
        let (_dir, chip, mut inventory) = setup(45_000, 900);
        let mut engine = Engine::new(timing());
        engine.apply_profile(linear_profile(&chip, SourceSettings::default()), &inventory);
        engine.enable().unwrap();

        // Out-of-domain reading turns the temp unavailable.
        fs::write(chip.join("temp1_input"), "300000\n").unwrap();
        refresh_values(&mut inventory);
        let changed = engine.tick(&mut inventory, Instant::now());
        assert!(changed.is_empty());
    }

    #[test]
    fn multi_source_rule_mixes_with_leading_settings() {
        let dir = TempDir::new().unwrap();
        let chip = write_chip(
            dir.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "CPUTIN", 45_000), (2, "SYSTIN", 30_000)],
                fans: &[(1, 900)],
                pwms: &[(1, 0, None)],
            },
        );
        let mut inventory = discover_at(dir.path()).unwrap();

        let points = vec![
            CurvePoint { temp_c: 30.0, percent: 20.0 },
            CurvePoint { temp_c: 60.0, percent: 80.0 },
        ];
        let mut profile = Profile::new("multi");
        profile.rules.push(Rule {
            pwm_path: chip.join("pwm1"),
            nickname: None,
            sources: vec![
                Source {
                    temp_paths: vec![chip.join("temp1_input")],
                    points: points.clone(),
                    settings: SourceSettings::default(), // Max mix leads
                },
                Source {
                    temp_paths: vec![chip.join("temp2_input")],
                    points,
                    settings: SourceSettings::default(),
                },
            ],
        });

        let mut engine = Engine::new(timing());
        engine.apply_profile(profile, &inventory);
        engine.enable().unwrap();
        engine.tick(&mut inventory, Instant::now());
        // Sources produce 50% and 20%; Max mix picks 50%.
        assert_eq!(fs::read_to_string(chip.join("pwm1")).unwrap(), "128");
    }
}
