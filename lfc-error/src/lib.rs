//! Unified error handling for LinuxFanControl
//!
//! This crate provides the single error type used across all daemon
//! components, plus the mapping from error kinds to the JSON-RPC domain
//! error codes exposed on the wire.

use std::io;
use std::path::PathBuf;

/// Result type alias using LfcError
pub type Result<T> = std::result::Result<T, LfcError>;

// ============================================================================
// JSON-RPC error codes
// ============================================================================

/// Domain error codes carried in JSON-RPC error objects (-32000..-32099),
/// alongside the standard codes (-32700..-32603).
pub mod rpc_code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const PROFILE_SAVE_FAILED: i32 = -32002;
    pub const PROFILE_NOT_FOUND: i32 = -32004;
    pub const CONFIG_SAVE_FAILED: i32 = -32010;
    pub const UPDATE_FETCH_FAILED: i32 = -32020;
    pub const UPDATE_NO_ASSET: i32 = -32021;
    pub const UPDATE_DOWNLOAD_FAILED: i32 = -32022;
    pub const IMPORT_JOB_NOT_FOUND: i32 = -32031;
    pub const IMPORT_JOB_NOT_CANCELABLE: i32 = -32032;
    pub const IMPORT_COMMIT_FAILED: i32 = -32033;
    pub const HWMON_UNAVAILABLE: i32 = -32040;
    pub const TELEMETRY_UNAVAILABLE: i32 = -32050;
}

/// Unified error type for all daemon operations
#[derive(thiserror::Error, Debug)]
pub enum LfcError {
    // ========================================================================
    // I/O and sysfs access
    // ========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Invalid value in {path}: {reason}")]
    InvalidValue { path: PathBuf, reason: String },

    #[error("Failed to write PWM {path}: {reason}")]
    PwmWrite { path: PathBuf, reason: String },

    // ========================================================================
    // Configuration and profiles
    // ========================================================================
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Failed to save profile {name}: {reason}")]
    ProfileSave { name: String, reason: String },

    #[error("Failed to save configuration: {0}")]
    ConfigSave(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ========================================================================
    // Jobs (detection, import)
    // ========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job is not cancelable: {0}")]
    NotCancelable(String),

    #[error("Import commit failed: {0}")]
    CommitFailed(String),

    // ========================================================================
    // Transport and telemetry
    // ========================================================================
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Update failed: {0}")]
    UpdateFetch(String),

    #[error("{0}")]
    Generic(String),
}

impl LfcError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create an invalid-config error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-value error for a sysfs file
    pub fn invalid_value(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Map this error to the JSON-RPC error code it surfaces as.
    pub fn rpc_code(&self) -> i32 {
        use rpc_code::*;
        match self {
            LfcError::ProfileNotFound(_) => PROFILE_NOT_FOUND,
            LfcError::ProfileSave { .. } => PROFILE_SAVE_FAILED,
            LfcError::ConfigSave(_) => CONFIG_SAVE_FAILED,
            LfcError::JobNotFound(_) => IMPORT_JOB_NOT_FOUND,
            LfcError::NotCancelable(_) => IMPORT_JOB_NOT_CANCELABLE,
            LfcError::CommitFailed(_) => IMPORT_COMMIT_FAILED,
            LfcError::UpdateFetch(_) => UPDATE_FETCH_FAILED,
            LfcError::Unavailable(msg) if msg.contains("telemetry") => TELEMETRY_UNAVAILABLE,
            LfcError::Unavailable(_) => HWMON_UNAVAILABLE,
            LfcError::JsonParse(_) => PARSE_ERROR,
            LfcError::InvalidConfig { .. }
            | LfcError::InvalidProfile(_)
            | LfcError::ValidationFailed(_)
            | LfcError::InvalidValue { .. } => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        }
    }
}

impl From<String> for LfcError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for LfcError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_match_catalogue() {
        assert_eq!(LfcError::ProfileNotFound("x".into()).rpc_code(), -32004);
        assert_eq!(
            LfcError::ProfileSave {
                name: "a".into(),
                reason: "disk".into()
            }
            .rpc_code(),
            -32002
        );
        assert_eq!(LfcError::ConfigSave("denied".into()).rpc_code(), -32010);
        assert_eq!(LfcError::JobNotFound("7".into()).rpc_code(), -32031);
        assert_eq!(LfcError::NotCancelable("7".into()).rpc_code(), -32032);
        assert_eq!(LfcError::CommitFailed("x".into()).rpc_code(), -32033);
        assert_eq!(
            LfcError::Unavailable("hwmon inventory".into()).rpc_code(),
            -32040
        );
        assert_eq!(
            LfcError::Unavailable("telemetry buffer".into()).rpc_code(),
            -32050
        );
    }

    #[test]
    fn invalid_params_family() {
        assert_eq!(
            LfcError::config("tickMs", "out of range").rpc_code(),
            rpc_code::INVALID_PARAMS
        );
        assert_eq!(
            LfcError::InvalidProfile("bad curve".into()).rpc_code(),
            rpc_code::INVALID_PARAMS
        );
    }
}
