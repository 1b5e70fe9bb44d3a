//! Mapping legacy identifiers onto the discovered inventory.
//!
//! Temperatures resolve by exact label match first, then by driver
//! heuristics with an indexed position inside the driver's channel list.
//! PWM outputs resolve their chip token against discovered driver names and
//! aliases (with the vendor map as a secondary hint) plus the pin index.
//! An identifier that cannot be resolved is a hard error; an ambiguous one
//! resolves to the first candidate and records a warning.

use std::path::PathBuf;

use lfc_error::{LfcError, Result};
use tracing::debug;

use crate::hw::Inventory;
use crate::import::fancontrol::LegacyControl;
use crate::profile::{CurvePoint, Profile, Rule, Source, SourceSettings};
use crate::vendor::VendorMap;

/// Result of mapping a whole document.
#[derive(Debug)]
pub struct MappingOutcome {
    pub profile: Profile,
    pub warnings: Vec<String>,
}

/// Drivers a generic token may refer to.
const TEMP_DRIVER_HINTS: &[(&str, &[&str])] = &[
    ("cpu", &["k10temp", "coretemp", "zenpower"]),
    ("k10temp", &["k10temp"]),
    ("coretemp", &["coretemp"]),
    ("gpu", &["amdgpu"]),
    ("amdgpu", &["amdgpu"]),
    ("nvme", &["nvme"]),
    ("ssd", &["nvme"]),
    ("acpitz", &["acpitz"]),
    ("motherboard", &["acpitz"]),
];

fn tokens_of(identifier: &str) -> Vec<String> {
    identifier
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

fn trailing_index(tokens: &[String]) -> Option<usize> {
    tokens.iter().rev().find_map(|t| t.parse::<usize>().ok())
}

/// Does a chip answer to this token?
fn chip_matches_token(chip: &crate::hw::Chip, token: &str) -> bool {
    if token.len() < 3 {
        return false;
    }
    let driver = chip.driver_name.to_ascii_lowercase();
    if token.contains(&driver) || driver.contains(token) {
        return true;
    }
    chip.aliases.iter().any(|alias| {
        let alias = alias.to_ascii_lowercase();
        token.contains(&alias) || alias.contains(token)
    })
}

/// Resolve a temperature identifier to an input path.
pub fn map_temp(
    identifier: &str,
    inventory: &Inventory,
    warnings: &mut Vec<String>,
) -> Result<PathBuf> {
    // 1. Exact label match anywhere in the inventory.
    let needle = identifier.trim().to_ascii_lowercase();
    let label_matches: Vec<_> = inventory
        .temps
        .iter()
        .filter(|t| {
            t.label
                .as_deref()
                .map(|l| l.trim().to_ascii_lowercase() == needle)
                .unwrap_or(false)
        })
        .collect();
    if let Some(first) = label_matches.first() {
        if label_matches.len() > 1 {
            warnings.push(format!(
                "temperature '{}' matches {} labels, using {}",
                identifier,
                label_matches.len(),
                first.input_path.display()
            ));
        }
        return accept_temp(identifier, first);
    }

    // 2. Driver heuristics plus indexed position.
    let tokens = tokens_of(identifier);
    let index = trailing_index(&tokens).unwrap_or(0);

    let mut candidate_drivers: Vec<&str> = Vec::new();
    for token in &tokens {
        for (hint, drivers) in TEMP_DRIVER_HINTS {
            if token == hint {
                candidate_drivers.extend(drivers.iter().copied());
            }
        }
    }
    // Chip tokens in the identifier count as driver hints too.
    for chip in &inventory.chips {
        if tokens.iter().any(|t| chip_matches_token(chip, t)) {
            candidate_drivers.push(chip.driver_name.as_str());
        }
    }

    for driver in candidate_drivers {
        let channel: Vec<_> = inventory
            .temps
            .iter()
            .filter(|t| {
                inventory
                    .chip_by_path(&t.chip_path)
                    .map(|c| c.driver_name.eq_ignore_ascii_case(driver))
                    .unwrap_or(false)
            })
            .collect();
        if let Some(temp) = channel.get(index).or_else(|| channel.first()) {
            if channel.get(index).is_none() {
                warnings.push(format!(
                    "temperature '{}': index {} out of range for {}, using first channel",
                    identifier, index, driver
                ));
            }
            return accept_temp(identifier, temp);
        }
    }

    Err(LfcError::ValidationFailed(format!(
        "temperature '{}' cannot be resolved on this system",
        identifier
    )))
}

fn accept_temp(identifier: &str, temp: &crate::hw::TempInput) -> Result<PathBuf> {
    // Only sensors currently reading inside the acceptable domain qualify.
    if temp.current_c.is_none() {
        return Err(LfcError::ValidationFailed(format!(
            "temperature '{}' resolved to {} but the sensor reads outside [-20, 150] degC",
            identifier,
            temp.input_path.display()
        )));
    }
    debug!(identifier, path = ?temp.input_path, "temperature mapped");
    Ok(temp.input_path.clone())
}

/// Resolve a fan/output identifier to a PWM path.
pub fn map_pwm(
    identifier: &str,
    inventory: &Inventory,
    vendor_map: Option<&VendorMap>,
    warnings: &mut Vec<String>,
) -> Result<PathBuf> {
    // Direct sysfs path form.
    if identifier.starts_with("/sys/") {
        let path = PathBuf::from(identifier);
        return match inventory.pwm_by_path(&path) {
            Some(_) => Ok(path),
            None => Err(LfcError::ValidationFailed(format!(
                "PWM path '{}' not present in inventory",
                identifier
            ))),
        };
    }

    let tokens = tokens_of(identifier);
    let pin = trailing_index(&tokens);

    let mut candidates: Vec<&crate::hw::Chip> = inventory
        .chips
        .iter()
        .filter(|chip| tokens.iter().any(|t| chip_matches_token(chip, t)))
        .collect();

    // Vendor-map hint: classify tokens and match the chip class.
    if candidates.is_empty() {
        if let Some(map) = vendor_map {
            let classes: Vec<String> = tokens
                .iter()
                .filter_map(|t| map.classify(t))
                .map(|m| m.class)
                .collect();
            candidates = inventory
                .chips
                .iter()
                .filter(|chip| {
                    chip.vendor_class
                        .as_deref()
                        .map(|c| classes.iter().any(|wanted| wanted == c))
                        .unwrap_or(false)
                })
                .collect();
        }
    }

    if candidates.is_empty() {
        return Err(LfcError::ValidationFailed(format!(
            "fan output '{}' names no chip discovered on this system",
            identifier
        )));
    }
    if candidates.len() > 1 {
        warnings.push(format!(
            "fan output '{}' is ambiguous across {} chips, using {}",
            identifier,
            candidates.len(),
            candidates[0].chip_name
        ));
    }

    for chip in &candidates {
        // FanControl pins are 0-based; sysfs pwm files are 1-based.
        let preferred: Vec<String> = match pin {
            Some(p) => vec![format!("pwm{}", p + 1), format!("pwm{}", p.max(1))],
            None => vec!["pwm1".to_string()],
        };
        for file in preferred {
            let path = chip.hwmon_path.join(&file);
            if inventory.pwm_by_path(&path).is_some() {
                debug!(identifier, path = ?path, "PWM mapped");
                return Ok(path);
            }
        }
    }

    Err(LfcError::ValidationFailed(format!(
        "fan output '{}': no matching pwmN on chip '{}'",
        identifier, candidates[0].chip_name
    )))
}

/// Map a parsed legacy document onto a profile.
pub fn map_controls(
    profile_name: &str,
    controls: &[LegacyControl],
    inventory: &Inventory,
    vendor_map: Option<&VendorMap>,
) -> Result<MappingOutcome> {
    let mut warnings = Vec::new();
    let mut profile = Profile::new(profile_name);
    profile.description = Some("imported from FanControl".to_string());

    for control in controls {
        let temp_path = map_temp(&control.sensor, inventory, &mut warnings)?;
        let pwm_path = map_pwm(&control.identifier, inventory, vendor_map, &mut warnings)?;

        let points: Vec<CurvePoint> = control
            .points
            .iter()
            .map(|(temp_c, percent)| CurvePoint {
                temp_c: *temp_c,
                percent: *percent,
            })
            .collect();

        profile.rules.push(Rule {
            pwm_path,
            nickname: Some(control.identifier.clone()),
            sources: vec![Source {
                temp_paths: vec![temp_path],
                points,
                settings: SourceSettings {
                    hysteresis_c: control.hysteresis_c.max(0.0),
                    response_tau_seconds: control.response_time_s.max(0.0),
                    ..SourceSettings::default()
                },
            }],
        });
    }

    Ok(MappingOutcome { profile, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::inventory::test_support::{write_chip, FakeChip};
    use crate::hw::discover_at;
    use tempfile::TempDir;

    fn inventory() -> (TempDir, Inventory) {
        let dir = TempDir::new().unwrap();
        write_chip(
            dir.path(),
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "SYSTIN", 38000), (2, "CPUTIN", 52000)],
                fans: &[(1, 820), (2, 1100)],
                pwms: &[(1, 128, Some(5)), (2, 200, None)],
            },
        );
        write_chip(
            dir.path(),
            1,
            &FakeChip {
                name: "k10temp",
                temps: &[(1, "Tctl", 61000), (2, "Tccd1", 58000)],
                fans: &[],
                pwms: &[],
            },
        );
        let inv = discover_at(dir.path()).unwrap();
        (dir, inv)
    }

    #[test]
    fn temp_by_exact_label() {
        let (_dir, inv) = inventory();
        let mut warnings = Vec::new();
        let path = map_temp("Tctl", &inv, &mut warnings).unwrap();
        assert!(path.ends_with("hwmon1/temp1_input"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn temp_by_driver_heuristic_with_index() {
        let (_dir, inv) = inventory();
        let mut warnings = Vec::new();
        // "cpu" hint plus index 1 -> second k10temp channel.
        let path = map_temp("/amd/cpu/0/temperature/1", &inv, &mut warnings).unwrap();
        assert!(path.ends_with("hwmon1/temp2_input"));
    }

    #[test]
    fn unresolvable_temp_is_hard_error() {
        let (_dir, inv) = inventory();
        let mut warnings = Vec::new();
        assert!(map_temp("Tctl_ghost", &inv, &mut warnings).is_err());
    }

    #[test]
    fn pwm_by_chip_token_and_pin() {
        let (_dir, inv) = inventory();
        let mut warnings = Vec::new();
        // 0-based pin 1 -> pwm2.
        let path = map_pwm("/lpc/nct6799d/0/control/1", &inv, None, &mut warnings).unwrap();
        assert!(path.ends_with("hwmon0/pwm2"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn pwm_unknown_chip_is_hard_error() {
        let (_dir, inv) = inventory();
        let mut warnings = Vec::new();
        assert!(map_pwm("/lpc/it8689/0/control/0", &inv, None, &mut warnings).is_err());
    }

    #[test]
    fn whole_document_maps_to_profile() {
        let (_dir, inv) = inventory();
        let controls = vec![LegacyControl {
            identifier: "/lpc/nct6799d/0/control/0".to_string(),
            sensor: "CPUTIN".to_string(),
            points: vec![(30.0, 20.0), (60.0, 80.0)],
            hysteresis_c: 4.0,
            response_time_s: 2.0,
        }];
        let outcome = map_controls("imported", &controls, &inv, None).unwrap();
        assert_eq!(outcome.profile.rules.len(), 1);
        let rule = &outcome.profile.rules[0];
        assert!(rule.pwm_path.ends_with("hwmon0/pwm1"));
        assert_eq!(rule.sources[0].settings.hysteresis_c, 4.0);
        assert_eq!(rule.sources[0].settings.response_tau_seconds, 2.0);
        assert_eq!(rule.sources[0].points.len(), 2);
    }
}
