//! Core library for the LinuxFanControl daemon.
//!
//! Modules, leaf-first:
//! - [`hw`]: hwmon inventory, sysfs access, coupling detection
//! - [`vendor`]: regex-driven chip classification with hot reload
//! - [`profile`]: the persisted rule model linking temps to PWMs
//! - [`engine`]: the stateful tick evaluator
//! - [`import`]: FanControl-legacy import and mapping verification
//! - [`config`]: daemon configuration resolution

pub mod config;
pub mod constants;
pub mod engine;
pub mod hw;
pub mod import;
pub mod profile;
pub mod vendor;

pub use config::DaemonConfig;
pub use engine::{Engine, EngineStatus, EngineTiming};
pub use hw::{discover, discover_at, refresh_values, Inventory};
pub use profile::Profile;
pub use vendor::{VendorMap, VendorMapWatcher, WatchMode};

pub use lfc_error::{LfcError, Result};

/// Spawn a named worker thread (detection sweeps, import jobs, the
/// vendor-map watcher all go through here).
pub(crate) fn spawn_worker<F>(name: String, body: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .expect("worker thread spawn failed")
}
