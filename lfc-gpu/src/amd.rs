//! AMD GPU back-end.
//!
//! Reads the amdgpu driver's hwmon interface: labelled temperature channels
//! (edge, junction, mem), fan tach, and PWM. Requires no vendor library.

use std::fs;
use std::path::{Path, PathBuf};

use lfc_error::Result;
use tracing::{debug, trace};

use crate::constants::{AMD_VENDOR_ID, MILLIDEGREE_DIVISOR};
use crate::drm::resolve_pci_bdf;
use crate::types::{GpuSample, GpuVendor};

/// Enumerate amdgpu devices under the DRM root.
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
        if !is_amd(&device_path) {
            continue;
        }

        let Some(hwmon_path) = find_hwmon(&device_path) else {
            debug!(card = %name, "amdgpu device without hwmon directory");
            continue;
        };

        let mut sample = GpuSample::new(GpuVendor::Amd, read_name(&device_path), index);
        sample.drm = Some(name.clone());
        sample.pci = resolve_pci_bdf(&device_path);
        sample.hwmon = Some(hwmon_path.to_string_lossy().to_string());
        sample.has_fan_tach = hwmon_path.join("fan1_input").exists();
        sample.has_fan_pwm = hwmon_path.join("pwm1").exists();
        read_metrics_into(&hwmon_path, &mut sample);

        trace!(card = %name, name = %sample.name, "amdgpu device");
        samples.push(sample);
        index += 1;
    }

    Ok(samples)
}

/// Refresh the mutable fields of an existing amdgpu sample.
pub fn refresh(sample: &mut GpuSample) {
    if let Some(hwmon) = sample.hwmon.clone() {
        read_metrics_into(Path::new(&hwmon), sample);
    }
}

fn is_amd(device_path: &Path) -> bool {
    fs::read_to_string(device_path.join("vendor"))
        .map(|id| id.trim() == AMD_VENDOR_ID)
        .unwrap_or(false)
}

fn find_hwmon(device_path: &Path) -> Option<PathBuf> {
    let hwmon_dir = device_path.join("hwmon");
    fs::read_dir(hwmon_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir())
}

fn read_name(device_path: &Path) -> String {
    // The marketing name is not in sysfs; fall back to the device id token.
    fs::read_to_string(device_path.join("device"))
        .map(|id| format!("AMD GPU {}", id.trim()))
        .unwrap_or_else(|_| "AMD GPU".to_string())
}

fn read_metrics_into(hwmon_path: &Path, sample: &mut GpuSample) {
    // amdgpu labels its temp channels; match on label, not index.
    for i in 1..=8u32 {
        let label_path = hwmon_path.join(format!("temp{}_label", i));
        let input_path = hwmon_path.join(format!("temp{}_input", i));
        let Ok(label) = fs::read_to_string(&label_path) else {
            continue;
        };
        let value = read_millidegrees(&input_path);
        match label.trim() {
            "edge" => sample.temp_edge_c = value,
            "junction" => sample.temp_hotspot_c = value,
            "mem" => sample.temp_mem_c = value,
            _ => {}
        }
    }
    // Unlabelled single-sensor chips: temp1 is the edge temperature.
    if sample.temp_edge_c.is_none() {
        sample.temp_edge_c = read_millidegrees(&hwmon_path.join("temp1_input"));
    }

    sample.fan_rpm = fs::read_to_string(hwmon_path.join("fan1_input"))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());

    let pwm_max = fs::read_to_string(hwmon_path.join("pwm1_max"))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(255);
    sample.fan_percent = fs::read_to_string(hwmon_path.join("pwm1"))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(|raw| ((raw * 100 + pwm_max / 2) / pwm_max).min(100) as u8);
}

fn read_millidegrees(path: &Path) -> Option<f64> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
        .map(|md| md as f64 / MILLIDEGREE_DIVISOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_amdgpu(root: &Path) -> PathBuf {
        let device = root.join("card0").join("device");
        let hwmon = device.join("hwmon").join("hwmon3");
        fs::create_dir_all(&hwmon).unwrap();
        fs::write(device.join("vendor"), "0x1002\n").unwrap();
        fs::write(device.join("device"), "0x747e\n").unwrap();
        fs::write(device.join("uevent"), "PCI_SLOT_NAME=0000:03:00.0\n").unwrap();
        fs::write(hwmon.join("temp1_label"), "edge\n").unwrap();
        fs::write(hwmon.join("temp1_input"), "54000\n").unwrap();
        fs::write(hwmon.join("temp2_label"), "junction\n").unwrap();
        fs::write(hwmon.join("temp2_input"), "63000\n").unwrap();
        fs::write(hwmon.join("temp3_label"), "mem\n").unwrap();
        fs::write(hwmon.join("temp3_input"), "58000\n").unwrap();
        fs::write(hwmon.join("fan1_input"), "1180\n").unwrap();
        fs::write(hwmon.join("pwm1"), "102\n").unwrap();
        hwmon
    }

    #[test]
    fn reads_labelled_temps_and_fan() {
        let dir = TempDir::new().unwrap();
        fake_amdgpu(dir.path());

        let samples = enumerate(dir.path()).unwrap();
        assert_eq!(samples.len(), 1);
        let gpu = &samples[0];
        assert_eq!(gpu.vendor, GpuVendor::Amd);
        assert_eq!(gpu.pci.as_deref(), Some("0000:03:00.0"));
        assert_eq!(gpu.temp_edge_c, Some(54.0));
        assert_eq!(gpu.temp_hotspot_c, Some(63.0));
        assert_eq!(gpu.temp_mem_c, Some(58.0));
        assert_eq!(gpu.fan_rpm, Some(1180));
        assert_eq!(gpu.fan_percent, Some(40));
        assert!(gpu.has_fan_tach);
        assert!(gpu.has_fan_pwm);
    }

    #[test]
    fn refresh_updates_metrics_only() {
        let dir = TempDir::new().unwrap();
        let hwmon = fake_amdgpu(dir.path());

        let mut samples = enumerate(dir.path()).unwrap();
        fs::write(hwmon.join("temp1_input"), "71000\n").unwrap();
        fs::write(hwmon.join("fan1_input"), "2400\n").unwrap();

        let pci_before = samples[0].pci.clone();
        refresh(&mut samples[0]);
        assert_eq!(samples[0].temp_edge_c, Some(71.0));
        assert_eq!(samples[0].fan_rpm, Some(2400));
        assert_eq!(samples[0].pci, pci_before);
    }
}
