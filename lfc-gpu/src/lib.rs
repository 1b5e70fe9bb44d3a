//! GPU inventory and metric refresh for LinuxFanControl
//!
//! Back-ends are enumerated in a fixed order - DRM cards first, then the
//! vendor back-ends (amdgpu sysfs, NVML/nvidia-smi, xe/i915 sysfs) - and
//! merged by composite identity. Inventory is a one-time snapshot; only
//! metric fields are refreshed afterwards.

pub mod amd;
pub mod constants;
pub mod drm;
pub mod intel;
pub mod nvidia;

mod types;

pub use types::{GpuSample, GpuVendor};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lfc_error::Result;
use tracing::{debug, info, warn};

/// GPU monitor: owns the merged sample list and the per-back-end
/// disabled flags.
///
/// A back-end that fails during the initial snapshot is disabled for the
/// rest of the session and logged once; refresh errors are silent and
/// retried at the next cadence.
pub struct GpuMonitor {
    drm_root: PathBuf,
    samples: Vec<GpuSample>,
    nvidia_disabled: bool,
}

impl GpuMonitor {
    pub fn new() -> Self {
        Self::with_drm_root(Path::new(constants::DRM_PATH))
    }

    /// Root-parameterised constructor for tests against a fake sysfs tree.
    pub fn with_drm_root(drm_root: &Path) -> Self {
        Self {
            drm_root: drm_root.to_path_buf(),
            samples: Vec::new(),
            nvidia_disabled: false,
        }
    }

    /// Enumerate every back-end and merge duplicates.
    ///
    /// Later back-ends enrich entries the earlier ones produced (filling the
    /// marketing name, temperatures, fan data) but never overwrite a field
    /// that is already set.
    pub fn snapshot(&mut self) -> Result<&[GpuSample]> {
        let mut merged: Vec<GpuSample> = Vec::new();

        let drm_samples = drm::enumerate(&self.drm_root)?;
        debug!(count = drm_samples.len(), "DRM cards enumerated");
        merge_samples(&mut merged, drm_samples);

        match amd::enumerate(&self.drm_root) {
            Ok(samples) => merge_samples(&mut merged, samples),
            Err(e) => warn!(error = %e, "amdgpu back-end failed"),
        }

        if !self.nvidia_disabled {
            match nvidia::enumerate() {
                Ok(samples) => merge_samples(&mut merged, samples),
                Err(e) => {
                    // Typical on systems without the proprietary driver.
                    debug!(error = %e, "NVIDIA back-end disabled for this session");
                    self.nvidia_disabled = true;
                }
            }
        }

        match intel::enumerate(&self.drm_root) {
            Ok(samples) => merge_samples(&mut merged, samples),
            Err(e) => warn!(error = %e, "Intel back-end failed"),
        }

        for (index, sample) in merged.iter_mut().enumerate() {
            sample.index = index as u32;
        }

        info!(count = merged.len(), "GPU inventory snapshot complete");
        self.samples = merged;
        Ok(&self.samples)
    }

    /// Refresh mutable metric fields of the existing samples.
    ///
    /// Entries whose backing files vanished keep their last reading as
    /// `None`; nothing is added until the next `snapshot()`.
    pub fn refresh_metrics(&mut self) {
        for sample in &mut self.samples {
            match sample.vendor {
                GpuVendor::Amd => amd::refresh(sample),
                GpuVendor::Intel => intel::refresh(sample),
                GpuVendor::Nvidia | GpuVendor::Unknown => {}
            }
        }
        if !self.nvidia_disabled
            && self
                .samples
                .iter()
                .any(|s| s.vendor == GpuVendor::Nvidia)
        {
            nvidia::refresh(&mut self.samples);
        }
    }

    pub fn samples(&self) -> &[GpuSample] {
        &self.samples
    }
}

impl Default for GpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge new samples into the accumulated list by composite identity.
fn merge_samples(merged: &mut Vec<GpuSample>, incoming: Vec<GpuSample>) {
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, s)| (s.dedup_key(), i))
        .collect();

    for sample in incoming {
        match index.get(&sample.dedup_key()) {
            Some(&i) => merged[i].enrich_from(&sample),
            None => {
                index.insert(sample.dedup_key(), merged.len());
                merged.push(sample);
            }
        }
    }
}
