//! Low-level hwmon reads and writes.
//!
//! Every operation maps I/O failures to a typed error (`NotFound`,
//! `PermissionDenied`, `InvalidValue`, `Io`). Callers in the refresh path
//! absorb these into per-value optionality; the engine treats them as
//! transient per-operation errors.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lfc_error::{LfcError, Result};
use tracing::{debug, warn};

use crate::constants::{pwm, temperature};

fn map_io(path: &Path, err: io::Error) -> LfcError {
    match err.kind() {
        io::ErrorKind::NotFound => LfcError::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => LfcError::PermissionDenied(path.to_path_buf()),
        _ => LfcError::Io(err),
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| map_io(path, e))
}

/// Read a temperature in degrees Celsius.
///
/// Readings outside the acceptable domain are an `InvalidValue` error;
/// the caller decides whether that means "unavailable".
pub fn read_temp_c(path: &Path) -> Result<f64> {
    let content = read_trimmed(path)?;
    let millidegrees = content
        .parse::<i64>()
        .map_err(|e| LfcError::invalid_value(path, format!("'{}': {}", content, e)))?;
    let celsius = millidegrees as f64 / temperature::MILLIDEGREE_DIVISOR;
    if !temperature::in_valid_range(celsius) {
        return Err(LfcError::invalid_value(
            path,
            format!("{celsius} degC outside acceptable domain"),
        ));
    }
    Ok(celsius)
}

/// Read a fan tach in RPM.
pub fn read_rpm(path: &Path) -> Result<u32> {
    let content = read_trimmed(path)?;
    content
        .parse::<u32>()
        .map_err(|e| LfcError::invalid_value(path, format!("'{}': {}", content, e)))
}

/// Read a raw PWM duty value.
pub fn read_raw(path: &Path) -> Result<u32> {
    let content = read_trimmed(path)?;
    content
        .parse::<u32>()
        .map_err(|e| LfcError::invalid_value(path, format!("'{}': {}", content, e)))
}

/// Read a PWM enable mode byte.
pub fn read_enable(path: &Path) -> Result<u8> {
    let content = read_trimmed(path)?;
    content
        .parse::<u8>()
        .map_err(|e| LfcError::invalid_value(path, format!("'{}': {}", content, e)))
}

/// Write a PWM enable mode directly.
pub fn write_enable(path: &Path, mode: u8) -> Result<()> {
    fs::write(path, mode.to_string()).map_err(|e| map_io(path, e))
}

/// Write a raw PWM value, clamped to `[0, pwm_max]`.
pub fn write_pwm_raw(path: &Path, value: u32, pwm_max: u32) -> Result<()> {
    let clamped = value.min(pwm_max);
    fs::write(path, clamped.to_string()).map_err(|e| LfcError::PwmWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Captured pre-manual enable mode for one PWM.
///
/// Whichever component first transitions a PWM into manual mode owns the
/// restore obligation; this handle carries it. `restore()` writes the
/// captured mode back; `Drop` does the same as a last resort so a panic or
/// early return cannot leave a fan stuck in manual.
#[derive(Debug)]
pub struct EnableRestore {
    enable_path: PathBuf,
    original_mode: u8,
    restored: bool,
}

impl EnableRestore {
    /// Capture the current mode and switch the PWM to manual.
    ///
    /// Returns `None` when there is no enable file (the PWM is always
    /// writable) or the mode is already manual.
    pub fn acquire(enable_path: &Path) -> Result<Option<Self>> {
        if !enable_path.exists() {
            return Ok(None);
        }
        let original_mode = read_enable(enable_path)?;
        if original_mode == pwm::enable::MANUAL || original_mode == pwm::enable::MANUAL_ALT {
            return Ok(None);
        }
        write_enable(enable_path, pwm::enable::MANUAL)?;
        debug!(path = ?enable_path, from = original_mode, "PWM switched to manual");
        Ok(Some(Self {
            enable_path: enable_path.to_path_buf(),
            original_mode,
            restored: false,
        }))
    }

    pub fn original_mode(&self) -> u8 {
        self.original_mode
    }

    /// Write the captured mode back.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        write_enable(&self.enable_path, self.original_mode)
    }
}

impl Drop for EnableRestore {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = write_enable(&self.enable_path, self.original_mode) {
                warn!(path = ?self.enable_path, error = %e, "failed to restore PWM enable mode");
            }
        }
    }
}
