//! Hardware access: hwmon inventory, sysfs reads/writes, coupling detection.

pub mod access;
pub mod detection;
pub mod inventory;

pub use access::{read_enable, read_raw, read_rpm, read_temp_c, write_enable, write_pwm_raw, EnableRestore};
pub use detection::{
    DetectionJob, DetectionPhase, DetectionState, DetectionStatus, DetectionTarget,
    DetectionTiming, PwmPeak,
};
pub use inventory::{discover, discover_at, refresh_values, Chip, FanInput, Inventory, PwmOutput, TempInput};
