//! NVIDIA GPU back-end.
//!
//! Primary path is NVML through `nvml-wrapper` (cargo feature `nvml`).
//! Without the feature, or when NVML fails to initialise, metrics come from
//! parsing `nvidia-smi` CSV output. The proprietary driver exposes no PWM
//! file, so `has_fan_pwm` stays false; fan percent is what the driver
//! reports.

use std::process::Command;

use lfc_error::{LfcError, Result};
use tracing::trace;

use crate::types::{GpuSample, GpuVendor};

/// Enumerate NVIDIA devices via NVML, falling back to `nvidia-smi`.
pub fn enumerate() -> Result<Vec<GpuSample>> {
    #[cfg(feature = "nvml")]
    {
        match enumerate_nvml() {
            Ok(samples) => return Ok(samples),
            Err(e) => tracing::debug!(error = %e, "NVML unavailable, trying nvidia-smi"),
        }
    }
    enumerate_smi()
}

/// Refresh mutable fields of existing NVIDIA samples in place.
pub fn refresh(samples: &mut [GpuSample]) {
    let fresh = match enumerate() {
        Ok(fresh) => fresh,
        Err(_) => return,
    };
    for sample in samples.iter_mut().filter(|s| s.vendor == GpuVendor::Nvidia) {
        let key = sample.dedup_key();
        if let Some(update) = fresh.iter().find(|f| f.dedup_key() == key) {
            sample.temp_edge_c = update.temp_edge_c;
            sample.temp_hotspot_c = update.temp_hotspot_c;
            sample.temp_mem_c = update.temp_mem_c;
            sample.fan_rpm = update.fan_rpm;
            sample.fan_percent = update.fan_percent;
        }
    }
}

#[cfg(feature = "nvml")]
fn enumerate_nvml() -> Result<Vec<GpuSample>> {
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
    use nvml_wrapper::Nvml;

    let nvml = Nvml::init().map_err(|e| LfcError::Gpu(format!("NVML init failed: {}", e)))?;
    let count = nvml
        .device_count()
        .map_err(|e| LfcError::Gpu(format!("NVML device count: {}", e)))?;

    let mut samples = Vec::new();
    for index in 0..count {
        let device = match nvml.device_by_index(index) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(index, error = %e, "NVML device lookup failed");
                continue;
            }
        };

        let mut sample = GpuSample::new(
            GpuVendor::Nvidia,
            device.name().unwrap_or_else(|_| "NVIDIA GPU".to_string()),
            index,
        );
        sample.pci = device
            .pci_info()
            .ok()
            .map(|pci| normalize_bdf(&pci.bus_id));
        sample.temp_edge_c = device
            .temperature(TemperatureSensor::Gpu)
            .ok()
            .map(|t| t as f64);
        sample.fan_percent = device.fan_speed(0).ok().map(|p| p.min(100) as u8);
        sample.has_fan_tach = false;
        sample.has_fan_pwm = false;

        trace!(index, name = %sample.name, "NVML device");
        samples.push(sample);
    }
    Ok(samples)
}

fn enumerate_smi() -> Result<Vec<GpuSample>> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,pci.bus_id,temperature.gpu,fan.speed",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .map_err(|e| LfcError::Gpu(format!("nvidia-smi not found: {}", e)))?;

    if !output.status.success() {
        return Err(LfcError::Gpu("nvidia-smi failed".to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_smi_output(&stdout))
}

fn parse_smi_output(stdout: &str) -> Vec<GpuSample> {
    let mut samples = Vec::new();

    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 5 {
            trace!(line, "skipping malformed nvidia-smi line");
            continue;
        }
        let Ok(index) = parts[0].parse::<u32>() else {
            continue;
        };

        let mut sample = GpuSample::new(GpuVendor::Nvidia, parts[1].to_string(), index);
        sample.pci = parse_field(parts[2]).map(|s| normalize_bdf(&s));
        sample.temp_edge_c = parse_field(parts[3]).and_then(|s| s.parse::<f64>().ok());
        sample.fan_percent = parse_field(parts[4])
            .and_then(|s| s.parse::<u32>().ok())
            .map(|p| p.min(100) as u8);
        samples.push(sample);
    }

    samples
}

fn parse_field(raw: &str) -> Option<String> {
    match raw {
        "" | "N/A" | "[N/A]" | "[Not Supported]" => None,
        other => Some(other.to_string()),
    }
}

/// nvidia-smi and NVML report an 8-hex-digit domain ("00000000:01:00.0");
/// trim to the 4-digit form used by the rest of sysfs.
fn normalize_bdf(bus_id: &str) -> String {
    let lower = bus_id.to_ascii_lowercase();
    match lower.split_once(':') {
        Some((domain, rest)) if domain.len() == 8 => {
            format!("{}:{}", &domain[4..], rest)
        }
        _ => lower,
    }
}
