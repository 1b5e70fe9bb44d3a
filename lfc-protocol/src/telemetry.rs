//! Telemetry snapshot schema.
//!
//! The JSON document written into shared memory (and returned by the
//! `telemetry.json` RPC). Field names are camelCase on the wire; fields are
//! only ever added, never renamed or removed.

use serde::{Deserialize, Serialize};

/// Root of the telemetry document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Schema version of this document
    pub version: u32,
    pub timestamp_ms: u64,
    pub engine_enabled: bool,
    pub tick_ms: u64,
    pub delta_c: f64,
    pub force_tick_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileSummary>,
    pub hwmon: HwmonTelemetry,
    pub gpus: Vec<GpuTelemetry>,
    /// PWM paths currently skipped after repeated write failures
    #[serde(default)]
    pub degraded_pwms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionTelemetry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub name: String,
    pub schema: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub curve_count: usize,
    pub control_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HwmonTelemetry {
    pub chips: Vec<ChipTelemetry>,
    pub temps: Vec<TempTelemetry>,
    pub fans: Vec<FanTelemetry>,
    pub pwms: Vec<PwmTelemetry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipTelemetry {
    pub hwmon_path: String,
    pub driver_name: String,
    pub chip_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempTelemetry {
    pub chip_path: String,
    pub input_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanTelemetry {
    pub chip_path: String,
    pub input_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PwmTelemetry {
    pub chip_path: String,
    pub pwm_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub pwm_max: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuTelemetry {
    pub vendor: String,
    pub name: String,
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pci: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwmon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_edge_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_hotspot_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_mem_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_rpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_percent: Option<u8>,
    pub has_fan_tach: bool,
    pub has_fan_pwm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionTelemetry {
    pub id: u64,
    pub state: String,
    pub phase: String,
    pub current_index: usize,
    pub total: usize,
}
