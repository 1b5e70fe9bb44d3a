//! Parser for FanControl-legacy configuration files.
//!
//! Two shapes are accepted: a `Controls` array with per-controller curve
//! data inline, and separate `Curves` + `Mappings` arrays where mappings
//! reference curves by name. Curve points come either normalised (0..1) or
//! as percent (0..100); the parser detects which and always emits percent.

use lfc_error::{LfcError, Result};
use serde_json::Value;
use tracing::debug;

/// One controller extracted from a legacy file, in neutral units.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyControl {
    /// Fan/output identifier as it appears in the file
    pub identifier: String,
    /// Temperature sensor identifier
    pub sensor: String,
    /// Curve points, percent on the Y axis, sorted by temperature
    pub points: Vec<(f64, f64)>,
    pub hysteresis_c: f64,
    pub response_time_s: f64,
}

/// Parse a legacy document into neutral controls.
pub fn parse_legacy(text: &str) -> Result<Vec<LegacyControl>> {
    let root: Value = serde_json::from_str(text)?;

    let controls = if root.get("Controls").is_some() {
        parse_controls_shape(&root)?
    } else if root.get("Curves").is_some() && root.get("Mappings").is_some() {
        parse_curves_mappings_shape(&root)?
    } else {
        return Err(LfcError::ValidationFailed(
            "unrecognised FanControl document: neither 'Controls' nor 'Curves'+'Mappings' present"
                .to_string(),
        ));
    };

    if controls.is_empty() {
        return Err(LfcError::ValidationFailed(
            "FanControl document contains no usable controllers".to_string(),
        ));
    }
    debug!(controls = controls.len(), "legacy document parsed");
    Ok(controls)
}

fn parse_controls_shape(root: &Value) -> Result<Vec<LegacyControl>> {
    let Some(entries) = root.get("Controls").and_then(Value::as_array) else {
        return Err(LfcError::ValidationFailed(
            "'Controls' is not an array".to_string(),
        ));
    };

    let mut controls = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let identifier = string_field(entry, &["FanId", "OutputId", "Fan", "Name"])
            .ok_or_else(|| {
                LfcError::ValidationFailed(format!("Controls[{}]: no fan identifier", index))
            })?;
        let sensor = string_field(entry, &["Sensor", "SensorId", "TempSource"]).ok_or_else(
            || LfcError::ValidationFailed(format!("Controls[{}]: no sensor reference", index)),
        )?;

        let curve_value = entry
            .get("SpeedCurve")
            .or_else(|| entry.get("Curve"))
            .ok_or_else(|| {
                LfcError::ValidationFailed(format!("Controls[{}]: no curve", index))
            })?;
        let points = parse_points(curve_value)
            .map_err(|e| LfcError::ValidationFailed(format!("Controls[{}]: {}", index, e)))?;

        controls.push(LegacyControl {
            identifier,
            sensor,
            points,
            hysteresis_c: number_field(entry, &["Hysteresis"]).unwrap_or(0.0),
            response_time_s: number_field(entry, &["ResponseTime"]).unwrap_or(0.0),
        });
    }
    Ok(controls)
}

fn parse_curves_mappings_shape(root: &Value) -> Result<Vec<LegacyControl>> {
    let curves = root
        .get("Curves")
        .and_then(Value::as_array)
        .ok_or_else(|| LfcError::ValidationFailed("'Curves' is not an array".to_string()))?;
    let mappings = root
        .get("Mappings")
        .and_then(Value::as_array)
        .ok_or_else(|| LfcError::ValidationFailed("'Mappings' is not an array".to_string()))?;

    let mut controls = Vec::new();
    for (index, mapping) in mappings.iter().enumerate() {
        let identifier = string_field(mapping, &["Fan", "Output", "FanId", "OutputId"])
            .ok_or_else(|| {
                LfcError::ValidationFailed(format!("Mappings[{}]: no fan identifier", index))
            })?;
        let sensor = string_field(mapping, &["Sensor", "SensorId", "TempSource"]).ok_or_else(
            || LfcError::ValidationFailed(format!("Mappings[{}]: no sensor reference", index)),
        )?;
        let curve_name = string_field(mapping, &["Curve", "CurveId"]).ok_or_else(|| {
            LfcError::ValidationFailed(format!("Mappings[{}]: no curve reference", index))
        })?;

        let curve = curves
            .iter()
            .find(|c| {
                string_field(c, &["Id", "Name"])
                    .map(|n| n == curve_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                LfcError::ValidationFailed(format!(
                    "Mappings[{}]: curve '{}' not found",
                    index, curve_name
                ))
            })?;

        let points_value = curve.get("Points").unwrap_or(curve);
        let points = parse_points(points_value).map_err(|e| {
            LfcError::ValidationFailed(format!("curve '{}': {}", curve_name, e))
        })?;

        controls.push(LegacyControl {
            identifier,
            sensor,
            points,
            hysteresis_c: number_field(curve, &["Hysteresis"]).unwrap_or(0.0),
            response_time_s: number_field(mapping, &["ResponseTime"])
                .or_else(|| number_field(curve, &["ResponseTime"]))
                .unwrap_or(0.0),
        });
    }
    Ok(controls)
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| value.get(n))
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn number_field(value: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| value.get(n)).and_then(Value::as_f64)
}

/// Parse curve points out of a JSON value.
///
/// Accepts `[[x, y], ...]` pairs and `[{"X":..,"Y":..}, ...]` objects
/// (lower-case keys and `Temperature`/`FanSpeed` aliases included). Output
/// is percent on the Y axis, sorted by X.
fn parse_points(value: &Value) -> std::result::Result<Vec<(f64, f64)>, String> {
    let entries = value
        .as_array()
        .ok_or_else(|| "curve points are not an array".to_string())?;

    let mut points = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let point = match entry {
            Value::Array(pair) if pair.len() == 2 => {
                let x = pair[0].as_f64().ok_or_else(|| format!("point {}: bad X", index))?;
                let y = pair[1].as_f64().ok_or_else(|| format!("point {}: bad Y", index))?;
                (x, y)
            }
            Value::Object(_) => {
                let x = number_field(entry, &["X", "x", "Temperature", "temp"])
                    .ok_or_else(|| format!("point {}: no X", index))?;
                let y = number_field(entry, &["Y", "y", "FanSpeed", "percent"])
                    .ok_or_else(|| format!("point {}: no Y", index))?;
                (x, y)
            }
            _ => return Err(format!("point {}: unsupported shape", index)),
        };
        points.push(point);
    }

    if points.is_empty() {
        return Err("curve has no points".to_string());
    }

    // Normalised curves (all Y within 0..1) become percent.
    let normalised = points.iter().all(|(_, y)| (0.0..=1.0).contains(y))
        && points.iter().any(|(_, y)| *y > 0.0);
    if normalised {
        for (_, y) in &mut points {
            *y *= 100.0;
        }
    }

    for (_, y) in &points {
        if !(0.0..=100.0).contains(y) {
            return Err(format!("fan percent {} outside [0, 100]", y));
        }
    }

    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_shape_with_percent_points() {
        let text = r#"{
            "Controls": [{
                "Name": "Case fan",
                "FanId": "/lpc/nct6799d/0/control/0",
                "Sensor": "/lpc/nct6799d/0/temperature/1",
                "SpeedCurve": [[30, 20], [60, 80]],
                "Hysteresis": 4.0,
                "ResponseTime": 2.0
            }]
        }"#;
        let controls = parse_legacy(text).unwrap();
        assert_eq!(controls.len(), 1);
        let c = &controls[0];
        assert_eq!(c.identifier, "/lpc/nct6799d/0/control/0");
        assert_eq!(c.points, vec![(30.0, 20.0), (60.0, 80.0)]);
        assert_eq!(c.hysteresis_c, 4.0);
        assert_eq!(c.response_time_s, 2.0);
    }

    #[test]
    fn normalised_points_become_percent() {
        let text = r#"{
            "Controls": [{
                "FanId": "fan0",
                "Sensor": "temp0",
                "Curve": [{"X": 30, "Y": 0.2}, {"X": 60, "Y": 0.8}]
            }]
        }"#;
        let controls = parse_legacy(text).unwrap();
        assert_eq!(controls[0].points, vec![(30.0, 20.0), (60.0, 80.0)]);
    }

    #[test]
    fn curves_plus_mappings_shape() {
        let text = r#"{
            "Curves": [
                {"Name": "quiet", "Points": [[60, 80], [30, 20]], "Hysteresis": 3.0}
            ],
            "Mappings": [
                {"Fan": "/lpc/it8689/0/control/1", "Sensor": "CPU Package", "Curve": "quiet"}
            ]
        }"#;
        let controls = parse_legacy(text).unwrap();
        assert_eq!(controls.len(), 1);
        // Points are sorted by temperature on the way in.
        assert_eq!(controls[0].points, vec![(30.0, 20.0), (60.0, 80.0)]);
        assert_eq!(controls[0].hysteresis_c, 3.0);
        assert_eq!(controls[0].sensor, "CPU Package");
    }

    #[test]
    fn missing_curve_reference_is_an_error() {
        let text = r#"{
            "Curves": [],
            "Mappings": [{"Fan": "f", "Sensor": "s", "Curve": "ghost"}]
        }"#;
        assert!(parse_legacy(text).is_err());
    }

    #[test]
    fn unknown_shape_is_an_error() {
        assert!(parse_legacy(r#"{"Fans": []}"#).is_err());
        assert!(parse_legacy("[]").is_err());
    }

    #[test]
    fn out_of_range_percent_rejected() {
        let text = r#"{
            "Controls": [{
                "FanId": "f", "Sensor": "s",
                "Curve": [[30, 150]]
            }]
        }"#;
        assert!(parse_legacy(text).is_err());
    }
}
