//! Daemon configuration.
//!
//! Resolution order, lowest to highest: built-in defaults, `LFCD_*` /
//! `LFC_*` environment variables, the `daemon.json` config file, CLI
//! arguments (applied by the daemon binary). Numeric knobs are clamped to
//! their documented ranges with a warning rather than rejected.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use lfc_error::{LfcError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{engine, paths, rpc, telemetry, vendor_map};
use crate::vendor::WatchMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub debug: bool,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShmConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilesConfig {
    pub dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub tick_ms: u64,
    pub delta_c: f64,
    pub force_tick_ms: u64,
}

/// The complete operational configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    pub log: LogConfig,
    pub rpc: RpcConfig,
    pub shm: ShmConfig,
    pub profiles: ProfilesConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    pub engine: EngineConfig,
    pub gpu_refresh_ms: u64,
    pub hwmon_refresh_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_map_path: Option<PathBuf>,
    pub vendor_map_watch_mode: WatchMode,
    pub vendor_map_throttle_ms: u64,
}

/// Partial overlay: the shape of `daemon.json` and of `config.set` params.
/// Every field is optional; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverlay {
    pub log: Option<LogOverlay>,
    pub rpc: Option<RpcOverlay>,
    pub shm: Option<ShmConfig>,
    pub profiles: Option<ProfilesOverlay>,
    pub pid_file: Option<PathBuf>,
    pub engine: Option<EngineOverlay>,
    pub gpu_refresh_ms: Option<u64>,
    pub hwmon_refresh_ms: Option<u64>,
    pub vendor_map_path: Option<PathBuf>,
    pub vendor_map_watch_mode: Option<WatchMode>,
    pub vendor_map_throttle_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOverlay {
    pub file: Option<PathBuf>,
    pub debug: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcOverlay {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilesOverlay {
    pub dir: Option<PathBuf>,
    pub active: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOverlay {
    pub tick_ms: Option<u64>,
    pub delta_c: Option<f64>,
    pub force_tick_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join(paths::APP_DIR);
        Self {
            log: LogConfig {
                file: None,
                debug: false,
                level: "info".to_string(),
            },
            rpc: RpcConfig {
                host: rpc::DEFAULT_HOST.to_string(),
                port: rpc::DEFAULT_PORT,
            },
            shm: ShmConfig {
                path: telemetry::DEFAULT_SHM_NAME.to_string(),
            },
            profiles: ProfilesConfig {
                dir: config_dir.join(paths::PROFILES_DIR),
                active: None,
            },
            pid_file: None,
            engine: EngineConfig {
                tick_ms: engine::TICK_MS_RANGE.1,
                delta_c: engine::DELTA_C_RANGE.1,
                force_tick_ms: engine::FORCE_TICK_MS_RANGE.1,
            },
            gpu_refresh_ms: engine::GPU_REFRESH_MS_RANGE.1,
            hwmon_refresh_ms: engine::HWMON_REFRESH_MS_RANGE.1,
            vendor_map_path: None,
            vendor_map_watch_mode: WatchMode::Mtime,
            vendor_map_throttle_ms: vendor_map::DEFAULT_THROTTLE_MS,
        }
    }
}

fn clamp_u64(value: u64, range: (u64, u64, u64), field: &str) -> u64 {
    let (min, _, max) = range;
    if value < min || value > max {
        warn!(field, value, min, max, "value outside range, clamping");
    }
    value.clamp(min, max)
}

fn clamp_f64(value: f64, range: (f64, f64, f64), field: &str) -> f64 {
    let (min, _, max) = range;
    if value < min || value > max {
        warn!(field, value, min, max, "value outside range, clamping");
    }
    value.clamp(min, max)
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "environment value unparsable, ignored");
            None
        }
    }
}

impl DaemonConfig {
    /// Defaults with environment fallbacks layered on top.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u64>("LFCD_TICK_MS") {
            config.engine.tick_ms = v;
        }
        if let Some(v) = env_parse::<f64>("LFCD_DELTA_C") {
            config.engine.delta_c = v;
        }
        if let Some(v) = env_parse::<u64>("LFCD_FORCE_TICK_MS") {
            config.engine.force_tick_ms = v;
        }
        if let Some(v) = env_parse::<u64>("LFCD_GPU_REFRESH_MS") {
            config.gpu_refresh_ms = v;
        }
        if let Some(v) = env_parse::<u64>("LFCD_HWMON_REFRESH_MS") {
            config.hwmon_refresh_ms = v;
        }
        if let Some(v) = env_string("LFCD_HOST") {
            config.rpc.host = v;
        }
        if let Some(v) = env_parse::<u16>("LFCD_PORT") {
            config.rpc.port = v;
        }
        if let Some(v) = env_string("LFCD_SHM_PATH") {
            config.shm.path = v;
        }
        if let Some(v) = env_string("LFCD_LOGFILE") {
            config.log.file = Some(expand_tilde(&v));
        }
        if let Some(v) = env_string("LFCD_PIDFILE") {
            config.pid_file = Some(expand_tilde(&v));
        }
        if let Some(v) = env_string("LFCD_PROFILES_PATH") {
            config.profiles.dir = expand_tilde(&v);
        }
        if let Some(v) = env_string("LFCD_PROFILE_NAME") {
            config.profiles.active = Some(v);
        }
        if let Some(v) = env_string("LFC_VENDOR_MAP") {
            config.vendor_map_path = Some(expand_tilde(&v));
        }
        if let Some(v) = env_string("LFC_VENDOR_MAP_WATCH") {
            match v.parse() {
                Ok(mode) => config.vendor_map_watch_mode = mode,
                Err(e) => warn!(error = %e, "LFC_VENDOR_MAP_WATCH ignored"),
            }
        }
        if let Some(v) = env_parse::<u64>("LFC_VENDOR_MAP_THROTTLE_MS") {
            config.vendor_map_throttle_ms = v;
        }

        config.clamp();
        config
    }

    /// Default location of `daemon.json`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join(paths::APP_DIR)
            .join(paths::DEFAULT_CONFIG_FILE)
    }

    /// Resolve: defaults, then env, then the config file if present.
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| env_string("LFCD_CONFIG_PATH").map(|p| expand_tilde(&p)))
            .unwrap_or_else(Self::default_config_path);

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let overlay: ConfigOverlay = serde_json::from_str(&content).map_err(|e| {
                LfcError::config("configFile", format!("{}: {}", path.display(), e))
            })?;
            config.merge_overlay(overlay);
            debug!(path = ?path, "config file applied");
        }

        config.clamp();
        Ok(config)
    }

    /// Apply a partial overlay (config file content or `config.set` params).
    pub fn merge_overlay(&mut self, overlay: ConfigOverlay) {
        if let Some(log) = overlay.log {
            if let Some(file) = log.file {
                self.log.file = Some(file);
            }
            if let Some(debug_flag) = log.debug {
                self.log.debug = debug_flag;
            }
            if let Some(level) = log.level {
                self.log.level = level;
            }
        }
        if let Some(rpc_overlay) = overlay.rpc {
            if let Some(host) = rpc_overlay.host {
                self.rpc.host = host;
            }
            if let Some(port) = rpc_overlay.port {
                self.rpc.port = port;
            }
        }
        if let Some(shm) = overlay.shm {
            self.shm = shm;
        }
        if let Some(profiles) = overlay.profiles {
            if let Some(dir) = profiles.dir {
                self.profiles.dir = dir;
            }
            if let Some(active) = profiles.active {
                self.profiles.active = Some(active);
            }
        }
        if let Some(pid_file) = overlay.pid_file {
            self.pid_file = Some(pid_file);
        }
        if let Some(engine_overlay) = overlay.engine {
            if let Some(tick_ms) = engine_overlay.tick_ms {
                self.engine.tick_ms = tick_ms;
            }
            if let Some(delta_c) = engine_overlay.delta_c {
                self.engine.delta_c = delta_c;
            }
            if let Some(force_tick_ms) = engine_overlay.force_tick_ms {
                self.engine.force_tick_ms = force_tick_ms;
            }
        }
        if let Some(v) = overlay.gpu_refresh_ms {
            self.gpu_refresh_ms = v;
        }
        if let Some(v) = overlay.hwmon_refresh_ms {
            self.hwmon_refresh_ms = v;
        }
        if let Some(v) = overlay.vendor_map_path {
            self.vendor_map_path = Some(v);
        }
        if let Some(v) = overlay.vendor_map_watch_mode {
            self.vendor_map_watch_mode = v;
        }
        if let Some(v) = overlay.vendor_map_throttle_ms {
            self.vendor_map_throttle_ms = v;
        }
        self.clamp();
    }

    fn clamp(&mut self) {
        self.engine.tick_ms = clamp_u64(self.engine.tick_ms, engine::TICK_MS_RANGE, "tickMs");
        self.engine.delta_c = clamp_f64(self.engine.delta_c, engine::DELTA_C_RANGE, "deltaC");
        self.engine.force_tick_ms = clamp_u64(
            self.engine.force_tick_ms,
            engine::FORCE_TICK_MS_RANGE,
            "forceTickMs",
        );
        self.gpu_refresh_ms = clamp_u64(
            self.gpu_refresh_ms,
            engine::GPU_REFRESH_MS_RANGE,
            "gpuRefreshMs",
        );
        self.hwmon_refresh_ms = clamp_u64(
            self.hwmon_refresh_ms,
            engine::HWMON_REFRESH_MS_RANGE,
            "hwmonRefreshMs",
        );
    }

    /// Persist to `daemon.json` (atomic temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LfcError::ConfigSave(format!("create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())
            .map_err(|e| LfcError::ConfigSave(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, path)
            .map_err(|e| LfcError::ConfigSave(format!("{}: {}", path.display(), e)))?;
        debug!(path = ?path, "config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for var in [
            "LFCD_TICK_MS",
            "LFCD_DELTA_C",
            "LFCD_FORCE_TICK_MS",
            "LFCD_GPU_REFRESH_MS",
            "LFCD_HWMON_REFRESH_MS",
            "LFCD_HOST",
            "LFCD_PORT",
            "LFCD_SHM_PATH",
            "LFCD_LOGFILE",
            "LFCD_PIDFILE",
            "LFCD_PROFILES_PATH",
            "LFCD_PROFILE_NAME",
            "LFCD_CONFIG_PATH",
            "LFC_VENDOR_MAP",
            "LFC_VENDOR_MAP_WATCH",
            "LFC_VENDOR_MAP_THROTTLE_MS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_match_documented_values() {
        clear_env();
        let config = DaemonConfig::from_env();
        assert_eq!(config.engine.tick_ms, 50);
        assert_eq!(config.engine.delta_c, 0.7);
        assert_eq!(config.engine.force_tick_ms, 2000);
        assert_eq!(config.gpu_refresh_ms, 1000);
        assert_eq!(config.hwmon_refresh_ms, 500);
        assert_eq!(config.rpc.host, "127.0.0.1");
        assert_eq!(config.rpc.port, 8777);
        assert_eq!(config.vendor_map_watch_mode, WatchMode::Mtime);
        assert_eq!(config.vendor_map_throttle_ms, 3000);
    }

    #[test]
    #[serial]
    fn env_values_apply_and_clamp() {
        clear_env();
        env::set_var("LFCD_TICK_MS", "2"); // below range, clamps to 5
        env::set_var("LFCD_DELTA_C", "1.5");
        env::set_var("LFCD_PORT", "9000");
        env::set_var("LFC_VENDOR_MAP_WATCH", "inotify");

        let config = DaemonConfig::from_env();
        assert_eq!(config.engine.tick_ms, 5);
        assert_eq!(config.engine.delta_c, 1.5);
        assert_eq!(config.rpc.port, 9000);
        assert_eq!(config.vendor_map_watch_mode, WatchMode::Inotify);
        clear_env();
    }

    #[test]
    #[serial]
    fn config_file_overrides_env() {
        clear_env();
        env::set_var("LFCD_PORT", "9000");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        fs::write(
            &path,
            r#"{"rpc": {"port": 9100}, "engine": {"tickMs": 100}}"#,
        )
        .unwrap();

        let config = DaemonConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.rpc.port, 9100); // file beats env
        assert_eq!(config.engine.tick_ms, 100);
        assert_eq!(config.engine.delta_c, 0.7); // untouched default
        clear_env();
    }

    #[test]
    #[serial]
    fn save_then_resolve_roundtrip() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");

        let mut config = DaemonConfig::default();
        config.rpc.port = 8800;
        config.profiles.active = Some("quiet".to_string());
        config.save(&path).unwrap();

        let loaded = DaemonConfig::resolve(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    #[serial]
    fn overlay_merge_is_partial() {
        clear_env();
        let mut config = DaemonConfig::default();
        let overlay: ConfigOverlay =
            serde_json::from_str(r#"{"engine": {"deltaC": 20.0}}"#).unwrap();
        config.merge_overlay(overlay);
        assert_eq!(config.engine.delta_c, 10.0); // clamped to max
        assert_eq!(config.engine.tick_ms, 50); // untouched
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde("~/profiles");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
