//! FanControl-legacy import: parsing, mapping, validation, async jobs.

pub mod fancontrol;
pub mod job;
pub mod mapping;

pub use fancontrol::{parse_legacy, LegacyControl};
pub use job::{ImportJob, ImportOptions, ImportState, ImportStatus};
pub use mapping::{map_controls, map_pwm, map_temp, MappingOutcome};

use serde::{Deserialize, Serialize};

use crate::hw::detection::{DetectionJob, DetectionTarget, DetectionTiming};
use crate::hw::Inventory;
use crate::profile::{validate_against_inventory, Profile, ValidationReport};

/// Per-PWM verdict of a mapping verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PwmVerify {
    pub pwm_path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_rpm: Option<u32>,
}

/// Result of `profile.verifyMapping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingVerifyReport {
    pub ok: bool,
    pub validation: ValidationReport,
    pub per_pwm: Vec<PwmVerify>,
}

/// Verify a profile's mapping against the live system.
///
/// Path existence and structure always run; with `with_detect` each
/// referenced PWM must additionally reach `rpm_min` during a synchronous
/// detection sweep. The caller serialises this against other detection
/// activity and suspends the engine for the duration.
pub fn verify_mapping(
    profile: &Profile,
    inventory: &Inventory,
    with_detect: bool,
    rpm_min: u32,
    timing: DetectionTiming,
) -> MappingVerifyReport {
    let validation = validate_against_inventory(profile, inventory);

    let mut per_pwm: Vec<PwmVerify> = profile
        .rules
        .iter()
        .map(|rule| PwmVerify {
            pwm_path: rule.pwm_path.display().to_string(),
            ok: inventory.pwm_by_path(&rule.pwm_path).is_some(),
            peak_rpm: None,
        })
        .collect();

    if with_detect && validation.ok {
        let targets: Vec<DetectionTarget> = profile
            .rules
            .iter()
            .filter_map(|rule| {
                let pwm = inventory.pwm_by_path(&rule.pwm_path)?;
                Some(DetectionTarget {
                    pwm_path: pwm.pwm_path.clone(),
                    enable_path: pwm.enable_path.clone(),
                    pwm_max: pwm.pwm_max,
                    chip_path: pwm.chip_path.clone(),
                    tach_paths: inventory
                        .tachs_on_chip(&pwm.chip_path)
                        .map(|t| t.input_path.clone())
                        .collect(),
                })
            })
            .collect();

        let outcome = DetectionJob::start(0, targets, timing).join();
        for peak in &outcome.per_pwm_peak_rpm {
            if let Some(entry) = per_pwm
                .iter_mut()
                .find(|p| p.pwm_path == peak.pwm_path.display().to_string())
            {
                entry.peak_rpm = Some(peak.peak_rpm);
                entry.ok = peak.peak_rpm >= rpm_min;
            }
        }
    }

    let ok = validation.ok && per_pwm.iter().all(|p| p.ok);
    MappingVerifyReport {
        ok,
        validation,
        per_pwm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::inventory::test_support::{write_chip, FakeChip};
    use crate::hw::discover_at;
    use crate::profile::{CurvePoint, Rule, Source, SourceSettings};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn detect_gate_flags_slow_fan() {
        let dir = TempDir::new().unwrap();
        let chip = write_chip(
            dir.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "SYSTIN", 40000)],
                fans: &[(1, 45)], // never exceeds 50 RPM
                pwms: &[(1, 120, None)],
            },
        );
        let inventory = discover_at(dir.path()).unwrap();

        let mut profile = Profile::new("p");
        profile.rules.push(Rule {
            pwm_path: chip.join("pwm1"),
            nickname: None,
            sources: vec![Source {
                temp_paths: vec![chip.join("temp1_input")],
                points: vec![CurvePoint { temp_c: 30.0, percent: 20.0 }],
                settings: SourceSettings::default(),
            }],
        });

        let timing = DetectionTiming {
            settle: Duration::from_millis(30),
            sample_interval: Duration::from_millis(5),
        };
        let report = verify_mapping(&profile, &inventory, true, 300, timing);
        assert!(!report.ok);
        assert_eq!(report.per_pwm.len(), 1);
        assert!(!report.per_pwm[0].ok);
        assert_eq!(report.per_pwm[0].peak_rpm, Some(45));
        assert!(report.validation.ok); // paths themselves are fine
    }

    #[test]
    fn without_detect_only_paths_are_checked() {
        let dir = TempDir::new().unwrap();
        let chip = write_chip(
            dir.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "SYSTIN", 40000)],
                fans: &[(1, 45)],
                pwms: &[(1, 120, None)],
            },
        );
        let inventory = discover_at(dir.path()).unwrap();

        let mut profile = Profile::new("p");
        profile.rules.push(Rule {
            pwm_path: chip.join("pwm1"),
            nickname: None,
            sources: vec![Source {
                temp_paths: vec![chip.join("temp1_input")],
                points: vec![CurvePoint { temp_c: 30.0, percent: 20.0 }],
                settings: SourceSettings::default(),
            }],
        });

        let report = verify_mapping(&profile, &inventory, false, 300, DetectionTiming::default());
        assert!(report.ok);
        assert!(report.per_pwm[0].peak_rpm.is_none());
    }
}
