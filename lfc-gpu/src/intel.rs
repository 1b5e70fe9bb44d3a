//! Intel GPU back-end.
//!
//! Covers the i915 and xe drivers through their hwmon interface. Discrete
//! Arc cards expose package temperature and sometimes a fan tach; integrated
//! parts usually expose nothing and are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use lfc_error::Result;
use tracing::trace;

use crate::constants::{INTEL_VENDOR_ID, MILLIDEGREE_DIVISOR};
use crate::drm::resolve_pci_bdf;
use crate::types::{GpuSample, GpuVendor};

/// Enumerate Intel devices under the DRM root.
pub fn enumerate(drm_root: &Path) -> Result<Vec<GpuSample>> {
    let mut samples = Vec::new();

    if !drm_root.is_dir() {
        return Ok(samples);
    }

    let mut names: Vec<String> = fs::read_dir(drm_root)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("card") && !n.contains('-'))
        .collect();
    names.sort();

    let mut index = 0u32;
    for name in names {
        let device_path = drm_root.join(&name).join("device");
        if !is_intel(&device_path) {
            continue;
        }
        let Some(hwmon_path) = find_hwmon(&device_path) else {
            continue;
        };

        let driver = read_driver(&device_path);
        let mut sample = GpuSample::new(
            GpuVendor::Intel,
            format!("Intel GPU ({})", driver.as_deref().unwrap_or("i915")),
            index,
        );
        sample.drm = Some(name.clone());
        sample.pci = resolve_pci_bdf(&device_path);
        sample.hwmon = Some(hwmon_path.to_string_lossy().to_string());
        sample.has_fan_tach = hwmon_path.join("fan1_input").exists();
        sample.has_fan_pwm = hwmon_path.join("pwm1").exists();
        read_metrics_into(&hwmon_path, &mut sample);

        trace!(card = %name, driver = ?driver, "Intel GPU");
        samples.push(sample);
        index += 1;
    }

    Ok(samples)
}

/// Refresh the mutable fields of an existing Intel sample.
pub fn refresh(sample: &mut GpuSample) {
    if let Some(hwmon) = sample.hwmon.clone() {
        read_metrics_into(Path::new(&hwmon), sample);
    }
}

fn is_intel(device_path: &Path) -> bool {
    fs::read_to_string(device_path.join("vendor"))
        .map(|id| id.trim() == INTEL_VENDOR_ID)
        .unwrap_or(false)
}

fn read_driver(device_path: &Path) -> Option<String> {
    let uevent = fs::read_to_string(device_path.join("uevent")).ok()?;
    uevent
        .lines()
        .find_map(|l| l.strip_prefix("DRIVER=").map(|d| d.trim().to_string()))
}

fn find_hwmon(device_path: &Path) -> Option<PathBuf> {
    fs::read_dir(device_path.join("hwmon"))
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
}

fn read_metrics_into(hwmon_path: &Path, sample: &mut GpuSample) {
    sample.temp_edge_c = fs::read_to_string(hwmon_path.join("temp1_input"))
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|md| md as f64 / MILLIDEGREE_DIVISOR);
    sample.fan_rpm = fs::read_to_string(hwmon_path.join("fan1_input"))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
}
