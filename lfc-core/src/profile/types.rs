//! Profile data model.
//!
//! A profile links temperature inputs to PWM outputs through rules. All
//! references are path strings, never pointers, so profiles stay portable
//! and survive inventory reloads.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current profile schema version
pub const PROFILE_SCHEMA_VERSION: u32 = 1;

/// Reduction across multiple temperatures or sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MixFunction {
    #[default]
    Max,
    Avg,
    Min,
}

impl MixFunction {
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            MixFunction::Max => values.iter().cloned().fold(f64::MIN, f64::max),
            MixFunction::Min => values.iter().cloned().fold(f64::MAX, f64::min),
            MixFunction::Avg => values.iter().sum::<f64>() / values.len() as f64,
        })
    }
}

/// One control point: temperature in, duty percent out
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurvePoint {
    pub temp_c: f64,
    pub percent: f64,
}

/// Per-source evaluation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSettings {
    #[serde(default)]
    pub min_percent: f64,
    #[serde(default = "default_max_percent")]
    pub max_percent: f64,
    #[serde(default)]
    pub mix_function: MixFunction,
    #[serde(default)]
    pub hysteresis_c: f64,
    #[serde(default)]
    pub response_tau_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spinup_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spinup_duration_ms: Option<u64>,
}

fn default_max_percent() -> f64 {
    100.0
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            min_percent: 0.0,
            max_percent: 100.0,
            mix_function: MixFunction::Max,
            hysteresis_c: 0.0,
            response_tau_seconds: 0.0,
            spinup_percent: None,
            spinup_duration_ms: None,
        }
    }
}

/// A temperature source feeding one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub temp_paths: Vec<PathBuf>,
    pub points: Vec<CurvePoint>,
    #[serde(default)]
    pub settings: SourceSettings,
}

/// One controlled PWM with its sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub pwm_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub sources: Vec<Source>,
}

/// Persisted profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rules: Vec<Rule>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_version: PROFILE_SCHEMA_VERSION,
            description: None,
            rules: Vec::new(),
        }
    }

    /// Union of temperature paths referenced by any rule.
    pub fn referenced_temp_paths(&self) -> Vec<&PathBuf> {
        let mut paths: Vec<&PathBuf> = self
            .rules
            .iter()
            .flat_map(|r| r.sources.iter())
            .flat_map(|s| s.temp_paths.iter())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn curve_count(&self) -> usize {
        self.rules.iter().map(|r| r.sources.len()).sum()
    }

    pub fn control_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_reduction() {
        let values = [20.0, 50.0, 35.0];
        assert_eq!(MixFunction::Max.reduce(&values), Some(50.0));
        assert_eq!(MixFunction::Min.reduce(&values), Some(20.0));
        assert_eq!(MixFunction::Avg.reduce(&values), Some(35.0));
        assert_eq!(MixFunction::Max.reduce(&[]), None);
    }

    #[test]
    fn settings_defaults_fill_in() {
        let source: Source = serde_json::from_str(
            r#"{"tempPaths":["/sys/class/hwmon/hwmon0/temp1_input"],"points":[]}"#,
        )
        .unwrap();
        assert_eq!(source.settings.max_percent, 100.0);
        assert_eq!(source.settings.mix_function, MixFunction::Max);
        assert!(source.settings.spinup_percent.is_none());
    }

    #[test]
    fn referenced_paths_deduplicate() {
        let shared = PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input");
        let mut profile = Profile::new("test");
        for pwm in ["pwm1", "pwm2"] {
            profile.rules.push(Rule {
                pwm_path: PathBuf::from(format!("/sys/class/hwmon/hwmon0/{}", pwm)),
                nickname: None,
                sources: vec![Source {
                    temp_paths: vec![shared.clone()],
                    points: vec![],
                    settings: SourceSettings::default(),
                }],
            });
        }
        assert_eq!(profile.referenced_temp_paths().len(), 1);
        assert_eq!(profile.control_count(), 2);
        assert_eq!(profile.curve_count(), 2);
    }
}
