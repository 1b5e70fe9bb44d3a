//! DRM card enumeration.
//!
//! The DRM back-end runs first and produces one sample per `cardN` node
//! under `/sys/class/drm`, tagged with the vendor read from the PCI id and
//! the real PCI BDF resolved from the device uevent. Vendor back-ends later
//! enrich these entries with names, temperatures, and fan data.

use std::fs;
use std::path::Path;

use lfc_error::Result;
use tracing::{debug, trace};

use crate::constants::{AMD_VENDOR_ID, INTEL_VENDOR_ID, NVIDIA_VENDOR_ID};
use crate::types::{GpuSample, GpuVendor};

/// Enumerate DRM cards under `root` (normally `/sys/class/drm`).
pub fn enumerate(root: &Path) -> Result<Vec<GpuSample>> {
    let mut samples = Vec::new();

    if !root.is_dir() {
        debug!(path = ?root, "DRM class directory not present");
        return Ok(samples);
    }

    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        // cardN only; connectors look like "card0-DP-1"
        if name.starts_with("card") && !name.contains('-') {
            names.push(name);
        }
    }
    names.sort();

    for (index, name) in names.iter().enumerate() {
        let card_path = root.join(name);
        let device_path = card_path.join("device");

        let vendor = read_vendor(&device_path);
        let pci = resolve_pci_bdf(&device_path);

        trace!(card = %name, vendor = %vendor, pci = ?pci, "DRM card");

        let mut sample = GpuSample::new(vendor, name.clone(), index as u32);
        sample.drm = Some(name.clone());
        // Placeholder stays the DRM node name when the BDF is not resolvable.
        sample.pci = pci;
        samples.push(sample);
    }

    Ok(samples)
}

fn read_vendor(device_path: &Path) -> GpuVendor {
    match fs::read_to_string(device_path.join("vendor")) {
        Ok(id) => match id.trim() {
            AMD_VENDOR_ID => GpuVendor::Amd,
            NVIDIA_VENDOR_ID => GpuVendor::Nvidia,
            INTEL_VENDOR_ID => GpuVendor::Intel,
            _ => GpuVendor::Unknown,
        },
        Err(_) => GpuVendor::Unknown,
    }
}

/// Resolve the PCI bus/device/function for a DRM device.
///
/// Prefers `PCI_SLOT_NAME` from the device uevent; falls back to the
/// basename of the resolved device symlink when it looks like a BDF.
pub fn resolve_pci_bdf(device_path: &Path) -> Option<String> {
    if let Ok(uevent) = fs::read_to_string(device_path.join("uevent")) {
        for line in uevent.lines() {
            if let Some(slot) = line.strip_prefix("PCI_SLOT_NAME=") {
                let slot = slot.trim();
                if !slot.is_empty() {
                    return Some(slot.to_string());
                }
            }
        }
    }

    let resolved = fs::canonicalize(device_path).ok()?;
    let base = resolved.file_name()?.to_str()?;
    if looks_like_bdf(base) {
        Some(base.to_string())
    } else {
        None
    }
}

fn looks_like_bdf(s: &str) -> bool {
    // dddd:bb:dd.f
    let bytes = s.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    s.char_indices().all(|(i, c)| match i {
        4 | 7 => c == ':',
        10 => c == '.',
        _ => c.is_ascii_hexdigit(),
    })
}
