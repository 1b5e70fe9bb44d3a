//! GPU data types

use serde::{Deserialize, Serialize};

/// GPU vendor type
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Amd,
    Nvidia,
    Intel,
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One discovered GPU with its latest metric readings.
///
/// Identity fields (`pci`, `drm`, `hwmon`, `name`) are fixed at snapshot
/// time; only the metric fields change during refresh.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GpuSample {
    pub vendor: GpuVendor,
    pub name: String,
    pub index: u32,
    /// PCI bus/device/function, e.g. "0000:01:00.0"
    pub pci: Option<String>,
    /// DRM node name, e.g. "card0"
    pub drm: Option<String>,
    /// Backing hwmon directory when the driver exposes one
    pub hwmon: Option<String>,
    pub temp_edge_c: Option<f64>,
    pub temp_hotspot_c: Option<f64>,
    pub temp_mem_c: Option<f64>,
    pub fan_rpm: Option<u32>,
    pub fan_percent: Option<u8>,
    pub has_fan_tach: bool,
    pub has_fan_pwm: bool,
}

impl GpuSample {
    pub fn new(vendor: GpuVendor, name: impl Into<String>, index: u32) -> Self {
        Self {
            vendor,
            name: name.into(),
            index,
            pci: None,
            drm: None,
            hwmon: None,
            temp_edge_c: None,
            temp_hotspot_c: None,
            temp_mem_c: None,
            fan_rpm: None,
            fan_percent: None,
            has_fan_tach: false,
            has_fan_pwm: false,
        }
    }

    /// Composite identity: first non-empty of PCI BDF, hwmon path,
    /// vendor+name. Two samples with the same key describe the same device.
    pub fn dedup_key(&self) -> String {
        if let Some(pci) = self.pci.as_deref().filter(|s| !s.is_empty()) {
            return format!("pci:{}", pci);
        }
        if let Some(hwmon) = self.hwmon.as_deref().filter(|s| !s.is_empty()) {
            return format!("hwmon:{}", hwmon);
        }
        format!("id:{}:{}", self.vendor, self.name)
    }

    /// Fill fields this sample lacks from `other`; never overwrite.
    pub fn enrich_from(&mut self, other: &GpuSample) {
        if self.pci.is_none() {
            self.pci = other.pci.clone();
        }
        if self.drm.is_none() {
            self.drm = other.drm.clone();
        }
        if self.hwmon.is_none() {
            self.hwmon = other.hwmon.clone();
        }
        if self.name.is_empty() || self.name.starts_with("card") {
            if !other.name.is_empty() && !other.name.starts_with("card") {
                self.name = other.name.clone();
            }
        }
        if self.temp_edge_c.is_none() {
            self.temp_edge_c = other.temp_edge_c;
        }
        if self.temp_hotspot_c.is_none() {
            self.temp_hotspot_c = other.temp_hotspot_c;
        }
        if self.temp_mem_c.is_none() {
            self.temp_mem_c = other.temp_mem_c;
        }
        if self.fan_rpm.is_none() {
            self.fan_rpm = other.fan_rpm;
        }
        if self.fan_percent.is_none() {
            self.fan_percent = other.fan_percent;
        }
        self.has_fan_tach |= other.has_fan_tach;
        self.has_fan_pwm |= other.has_fan_pwm;
    }
}
