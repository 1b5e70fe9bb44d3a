//! Central constants for the daemon core.
//!
//! Ranges and defaults here are the single source of truth; the config
//! layer clamps user input against them.

/// Filesystem locations
pub mod paths {
    /// Base directory for hwmon chips
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// Default daemon config file (under the user config dir)
    pub const DEFAULT_CONFIG_FILE: &str = "daemon.json";

    /// Default profiles directory name (under the user config dir)
    pub const PROFILES_DIR: &str = "profiles";

    /// Application directory name under the platform config dir
    pub const APP_DIR: &str = "linuxfancontrol";
}

/// Temperature handling
pub mod temperature {
    /// hwmon reports millidegrees Celsius
    pub const MILLIDEGREE_DIVISOR: f64 = 1000.0;

    /// Acceptable sensor domain; readings outside are treated as unavailable
    pub const MIN_VALID_C: f64 = -20.0;
    pub const MAX_VALID_C: f64 = 150.0;

    pub fn in_valid_range(celsius: f64) -> bool {
        (MIN_VALID_C..=MAX_VALID_C).contains(&celsius)
    }
}

/// PWM handling
pub mod pwm {
    /// Default raw ceiling when the chip exposes no `pwmN_max`
    pub const DEFAULT_MAX: u32 = 255;

    /// Enable-file modes
    pub mod enable {
        pub const AUTO: u8 = 0;
        pub const MANUAL: u8 = 1;
        /// Some drivers use 2 for "manual via software"
        pub const MANUAL_ALT: u8 = 2;
    }

    /// Consecutive write failures before a PWM is marked degraded
    pub const DEGRADE_THRESHOLD: u32 = 3;

    pub fn to_percent(raw: u32, max: u32) -> u8 {
        if max == 0 {
            return 0;
        }
        (((raw as u64 * 100) + (max as u64 / 2)) / max as u64).min(100) as u8
    }

    pub fn from_percent(percent: f64, max: u32) -> u32 {
        ((percent.clamp(0.0, 100.0) / 100.0) * max as f64).round() as u32
    }
}

/// Engine timing knobs: (min, default, max)
pub mod engine {
    pub const TICK_MS_RANGE: (u64, u64, u64) = (5, 50, 1000);
    pub const DELTA_C_RANGE: (f64, f64, f64) = (0.0, 0.7, 10.0);
    pub const FORCE_TICK_MS_RANGE: (u64, u64, u64) = (100, 2000, 10_000);
    pub const GPU_REFRESH_MS_RANGE: (u64, u64, u64) = (100, 1000, 60_000);
    pub const HWMON_REFRESH_MS_RANGE: (u64, u64, u64) = (100, 500, 60_000);

    /// Main-loop sleep clamp
    pub const MIN_SLEEP_MS: u64 = 1;
    pub const MAX_SLEEP_MS: u64 = 50;
}

/// Detection sweep timing
pub mod detection {
    /// Settle window after ramping a PWM to full
    pub const SETTLE_MS: u64 = 3000;

    /// Tach sampling interval inside the settle window
    pub const SAMPLE_INTERVAL_MS: u64 = 150;

    /// Raw value written during the ramp phase (full duty)
    pub const RAMP_PERCENT: f64 = 100.0;
}

/// Vendor mapping defaults
pub mod vendor_map {
    /// Minimum interval between mtime polls
    pub const DEFAULT_THROTTLE_MS: u64 = 3000;
}

/// RPC defaults
pub mod rpc {
    pub const DEFAULT_HOST: &str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8777;
}

/// Telemetry defaults
pub mod telemetry {
    pub const DEFAULT_SHM_NAME: &str = "lfc.telemetry";
    pub const DEFAULT_FALLBACK_FILE: &str = "/tmp/lfc.telemetry.json";
}
