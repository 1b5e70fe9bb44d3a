//! Shared constants for GPU discovery

/// Base directory for DRM card nodes
pub const DRM_PATH: &str = "/sys/class/drm";

/// PCI vendor ids as they appear in sysfs `vendor` files
pub const AMD_VENDOR_ID: &str = "0x1002";
pub const NVIDIA_VENDOR_ID: &str = "0x10de";
pub const INTEL_VENDOR_ID: &str = "0x8086";

/// hwmon reports temperatures in millidegrees Celsius
pub const MILLIDEGREE_DIVISOR: f64 = 1000.0;
