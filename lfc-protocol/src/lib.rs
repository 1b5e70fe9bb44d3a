//! Wire types shared between the daemon and its clients.
//!
//! Three surfaces live here:
//! - the JSON-RPC 2.0 envelope used on the TCP command channel,
//! - the telemetry snapshot schema published through shared memory,
//! - the fixed shared-memory header layout readers depend on.
//!
//! Everything is plain serde data; no I/O happens in this crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod shm;
pub mod telemetry;

pub use shm::{ShmHeader, SHM_CAPACITY_MIN, SHM_HEADER_LEN, SHM_MAGIC, SHM_VERSION};
pub use telemetry::*;

/// Maximum accepted request line on the RPC channel (64 KiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum path length accepted in RPC parameters
const MAX_PATH_LENGTH: usize = 256;

const ALLOWED_PATH_PREFIXES: &[&str] = &["/sys/class/hwmon/", "/sys/devices/"];

const FORBIDDEN_PATH_COMPONENTS: &[&str] = &["..", "//", "\0", "\n", "\r"];

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// JSON-RPC envelope
// ============================================================================

/// A single parsed JSON-RPC request.
///
/// `id: None` marks a notification; the server produces no response for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Notifications carry no id and must not be answered.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Reject envelopes that do not claim JSON-RPC 2.0.
    pub fn validate_envelope(&self) -> Result<(), String> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version '{}'", self.jsonrpc));
        }
        if self.method.is_empty() {
            return Err("empty method name".to_string());
        }
        Ok(())
    }
}

/// Payload of a successful response: `{method, success: true, data}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResultBody {
    pub method: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
}

/// A single response, success or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResultBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn success(id: Value, method: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(RpcResultBody {
                method: method.into(),
                success: true,
                data,
            }),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

// ============================================================================
// Path validation
// ============================================================================

/// Validate a sysfs path received over RPC.
///
/// Accepts absolute paths under the hwmon allowlist, rejects traversal and
/// control characters. Returns a human-readable reason on rejection.
pub fn validate_hwmon_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("empty path".to_string());
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(format!("path exceeds {} bytes", MAX_PATH_LENGTH));
    }
    if !ALLOWED_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err(format!(
            "path must start with one of {:?}",
            ALLOWED_PATH_PREFIXES
        ));
    }
    for component in FORBIDDEN_PATH_COMPONENTS {
        if path.contains(component) {
            return Err(format!("path contains forbidden sequence {:?}", component));
        }
    }
    Ok(())
}

/// Validate a PWM write target: a hwmon path whose file name is `pwmN`.
pub fn validate_pwm_target_path(path: &str) -> Result<(), String> {
    validate_hwmon_path(path)?;

    let file_name = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| "invalid PWM path".to_string())?;

    let suffix = file_name
        .strip_prefix("pwm")
        .ok_or_else(|| "path does not point to a pwmN control file".to_string())?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return Err("path does not point to a pwmN control file".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let req = RpcRequest::new("engine.enable", None, Some(json!(7)));
        let text = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method, "engine.enable");
        assert_eq!(back.id, Some(json!(7)));
        assert!(!back.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(req.is_notification());
        assert!(req.validate_envelope().is_ok());
    }

    #[test]
    fn rejects_wrong_version() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap();
        assert!(req.validate_envelope().is_err());
    }

    #[test]
    fn success_envelope_shape() {
        let resp = RpcResponse::success(json!(1), "ping", Some(json!("pong")));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["result"]["method"], "ping");
        assert_eq!(v["result"]["success"], true);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn error_envelope_shape() {
        let resp = RpcResponse::error(json!(2), -32601, "method not found");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["code"], -32601);
        assert!(v.get("result").is_none());
    }

    #[test]
    fn path_validation_allowlist() {
        assert!(validate_hwmon_path("/sys/class/hwmon/hwmon0/temp1_input").is_ok());
        assert!(validate_hwmon_path("/etc/passwd").is_err());
        assert!(validate_hwmon_path("/sys/class/hwmon/../../etc").is_err());
        assert!(validate_hwmon_path("").is_err());
    }

    #[test]
    fn pwm_target_validation() {
        assert!(validate_pwm_target_path("/sys/class/hwmon/hwmon0/pwm1").is_ok());
        assert!(validate_pwm_target_path("/sys/class/hwmon/hwmon0/pwm1_enable").is_err());
        assert!(validate_pwm_target_path("/sys/class/hwmon/hwmon0/fan1_input").is_err());
    }
}
