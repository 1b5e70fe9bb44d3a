//! Profile validation.
//!
//! Two layers: structural checks on the profile alone (curve ordering,
//! settings bounds) and referential checks against the live inventory
//! (every pwmPath/tempPath must exist). A profile that fails referential
//! checks may still be loaded; the engine just refuses to enable with it.

use serde::{Deserialize, Serialize};

use crate::hw::Inventory;
use crate::profile::types::Profile;

/// Outcome of validating one profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn finish(mut self) -> Self {
        self.ok = self.errors.is_empty();
        self
    }
}

/// Structural checks only; no inventory needed.
pub fn validate_structure(profile: &Profile) -> ValidationReport {
    let mut report = ValidationReport::default();

    if profile.rules.is_empty() {
        report.warning("profile has no rules");
    }

    for (rule_index, rule) in profile.rules.iter().enumerate() {
        let rule_name = rule
            .nickname
            .clone()
            .unwrap_or_else(|| format!("rule #{}", rule_index));

        if rule.sources.is_empty() {
            report.error(format!("{}: no sources", rule_name));
        }

        for (source_index, source) in rule.sources.iter().enumerate() {
            let tag = format!("{} source #{}", rule_name, source_index);

            if source.temp_paths.is_empty() {
                report.error(format!("{}: no temperature inputs", tag));
            }
            if source.points.is_empty() {
                report.error(format!("{}: empty curve", tag));
            }

            for window in source.points.windows(2) {
                if window[1].temp_c < window[0].temp_c {
                    report.error(format!(
                        "{}: curve points not ordered by temperature ({} after {})",
                        tag, window[1].temp_c, window[0].temp_c
                    ));
                }
            }
            for point in &source.points {
                if !(0.0..=100.0).contains(&point.percent) {
                    report.error(format!(
                        "{}: percent {} outside [0, 100]",
                        tag, point.percent
                    ));
                }
            }

            let s = &source.settings;
            if s.min_percent > s.max_percent {
                report.error(format!(
                    "{}: minPercent {} > maxPercent {}",
                    tag, s.min_percent, s.max_percent
                ));
            }
            if s.hysteresis_c < 0.0 {
                report.error(format!("{}: negative hysteresis", tag));
            }
            if s.response_tau_seconds < 0.0 {
                report.error(format!("{}: negative response tau", tag));
            }
            if let Some(spinup) = s.spinup_percent {
                if !(0.0..=100.0).contains(&spinup) {
                    report.error(format!("{}: spinupPercent {} outside [0, 100]", tag, spinup));
                }
            }
        }
    }

    report.finish()
}

/// Structural plus referential checks against the inventory.
pub fn validate_against_inventory(profile: &Profile, inventory: &Inventory) -> ValidationReport {
    let mut report = validate_structure(profile);
    report.ok = false; // recomputed by finish()

    for rule in &profile.rules {
        if inventory.pwm_by_path(&rule.pwm_path).is_none() {
            report.error(format!(
                "PWM output {} not present in inventory",
                rule.pwm_path.display()
            ));
        }
        for source in &rule.sources {
            for temp_path in &source.temp_paths {
                if inventory.temp_by_path(temp_path).is_none() {
                    report.error(format!(
                        "temperature input {} not present in inventory",
                        temp_path.display()
                    ));
                }
            }
        }
    }

    report.finish()
}
