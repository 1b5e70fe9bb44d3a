//! Vendor mapping: regex-driven classification of chip names.
//!
//! The rules file is a JSON array of `{regex, vendor, class, priority,
//! flags}`. For a chip name all matching rules are considered; the highest
//! priority wins, ties broken by file order. The only supported flag is
//! `"i"` (case-insensitive); a leading inline flag sequence such as `(?i)`
//! is folded into the flags, and any other inline flag letter is rejected
//! at compile time rather than silently mis-matching.
//!
//! Hot reload comes in two modes: mtime polling (throttled) and inotify.
//! A reload that fails to parse keeps the previous mapping in effect.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use lfc_error::{LfcError, Result};
use parking_lot::RwLock;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::vendor_map;
use crate::hw::Inventory;

/// One rule as it appears in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorRule {
    pub regex: String,
    pub vendor: String,
    pub class: String,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

#[derive(Debug)]
struct CompiledRule {
    regex: regex::Regex,
    vendor: String,
    class: String,
    priority: i32,
    file_order: usize,
}

/// Result of classifying one chip name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorMatch {
    pub vendor: String,
    pub class: String,
}

/// Compiled rule set
#[derive(Debug, Default)]
pub struct VendorMap {
    rules: Vec<CompiledRule>,
}

impl VendorMap {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw_rules: Vec<VendorRule> = serde_json::from_str(content)?;
        let mut rules = Vec::with_capacity(raw_rules.len());

        for (file_order, raw) in raw_rules.into_iter().enumerate() {
            let (pattern, inline_flags) = split_inline_flags(&raw.regex);

            let mut case_insensitive = false;
            for flag in inline_flags
                .chars()
                .chain(raw.flags.as_deref().unwrap_or("").chars())
            {
                match flag {
                    'i' => case_insensitive = true,
                    other => {
                        return Err(LfcError::config(
                            "vendorMap",
                            format!("unsupported regex flag '{}' in rule {}", other, file_order),
                        ));
                    }
                }
            }

            let regex = RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| {
                    LfcError::config("vendorMap", format!("rule {}: {}", file_order, e))
                })?;

            rules.push(CompiledRule {
                regex,
                vendor: raw.vendor,
                class: raw.class,
                priority: raw.priority,
                file_order,
            });
        }

        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| LfcError::NotFound(format!("{}: {}", path.display(), e)))?;
        let map = Self::from_json_str(&content)?;
        debug!(path = ?path, rules = map.rules.len(), "vendor map loaded");
        Ok(map)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Classify a chip name. Highest priority wins; ties go to the rule
    /// that appears first in the file.
    pub fn classify(&self, chip_name: &str) -> Option<VendorMatch> {
        self.rules
            .iter()
            .filter(|rule| rule.regex.is_match(chip_name))
            .min_by_key(|rule| (std::cmp::Reverse(rule.priority), rule.file_order))
            .map(|rule| VendorMatch {
                vendor: rule.vendor.clone(),
                class: rule.class.clone(),
            })
    }

    /// Stamp vendor label and class onto every chip of the inventory.
    pub fn apply_to_inventory(&self, inventory: &mut Inventory) {
        for chip in &mut inventory.chips {
            let matched = self
                .classify(&chip.chip_name)
                .or_else(|| self.classify(&chip.driver_name))
                .or_else(|| {
                    chip.aliases
                        .iter()
                        .find_map(|alias| self.classify(alias))
                });
            if let Some(m) = matched {
                chip.vendor_label = Some(m.vendor);
                chip.vendor_class = Some(m.class);
            }
        }
    }
}

/// Split a leading inline flag group (e.g. `(?i)foo`) off a pattern.
fn split_inline_flags(pattern: &str) -> (&str, &str) {
    if let Some(rest) = pattern.strip_prefix("(?") {
        if let Some(close) = rest.find(')') {
            let flags = &rest[..close];
            if !flags.is_empty() && flags.chars().all(|c| c.is_ascii_alphabetic()) {
                return (&pattern[close + 3..], flags);
            }
        }
    }
    (pattern, "")
}

// ============================================================================
// Hot reload
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    Mtime,
    Inotify,
}

impl std::str::FromStr for WatchMode {
    type Err = LfcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mtime" => Ok(WatchMode::Mtime),
            "inotify" => Ok(WatchMode::Inotify),
            other => Err(LfcError::config(
                "vendorMapWatchMode",
                format!("'{}' is not one of mtime, inotify", other),
            )),
        }
    }
}

/// Shared handle to the current mapping plus the watcher thread.
pub struct VendorMapWatcher {
    shared: Arc<RwLock<VendorMap>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl VendorMapWatcher {
    /// Load the initial mapping and start the watcher thread.
    ///
    /// A missing or broken file at startup yields an empty mapping; the
    /// watcher still runs and picks the file up once it becomes readable.
    pub fn start(path: PathBuf, mode: WatchMode, throttle_ms: u64) -> Self {
        let initial = match VendorMap::load(&path) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = ?path, error = %e, "vendor map unavailable, starting empty");
                VendorMap::default()
            }
        };
        let shared = Arc::new(RwLock::new(initial));
        let stop = Arc::new(AtomicBool::new(false));

        let throttle = Duration::from_millis(throttle_ms.max(50));
        // Baseline mtime is captured before the thread starts so an edit
        // racing the spawn is still detected.
        let initial_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        let worker_shared = shared.clone();
        let worker_stop = stop.clone();
        let handle = crate::spawn_worker("lfc-vendor-watch".to_string(), move || match mode {
            WatchMode::Mtime => {
                watch_mtime(path, throttle, worker_shared, worker_stop, initial_mtime)
            }
            WatchMode::Inotify => watch_inotify(path, throttle, worker_shared, worker_stop),
        });

        Self {
            shared,
            stop,
            handle: Some(handle),
        }
    }

    /// Watcher-free handle (used when no vendor map is configured).
    pub fn empty() -> Self {
        Self {
            shared: Arc::new(RwLock::new(VendorMap::default())),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn map(&self) -> Arc<RwLock<VendorMap>> {
        self.shared.clone()
    }

    pub fn classify(&self, chip_name: &str) -> Option<VendorMatch> {
        self.shared.read().classify(chip_name)
    }

    pub fn apply_to_inventory(&self, inventory: &mut Inventory) {
        self.shared.read().apply_to_inventory(inventory);
    }
}

impl Drop for VendorMapWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn reload_into(path: &Path, shared: &Arc<RwLock<VendorMap>>) {
    match VendorMap::load(path) {
        Ok(map) => {
            info!(path = ?path, rules = map.rule_count(), "vendor map reloaded");
            *shared.write() = map;
        }
        Err(e) => {
            // Previous mapping stays in effect.
            warn!(path = ?path, error = %e, "vendor map reload failed, keeping previous");
        }
    }
}

fn watch_mtime(
    path: PathBuf,
    throttle: Duration,
    shared: Arc<RwLock<VendorMap>>,
    stop: Arc<AtomicBool>,
    initial_mtime: Option<SystemTime>,
) {
    let mut last_mtime = initial_mtime;
    let mut last_poll = std::time::Instant::now();

    // Sleep in short slices so shutdown stays responsive; the throttle
    // bounds how often the file is actually stat'ed.
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(throttle.min(Duration::from_millis(50)));
        if last_poll.elapsed() < throttle {
            continue;
        }
        last_poll = std::time::Instant::now();

        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime != last_mtime {
            last_mtime = mtime;
            reload_into(&path, &shared);
        }
    }
}

/// Fallback entry for the inotify path: baseline from the current mtime.
fn watch_mtime_from_now(
    path: PathBuf,
    throttle: Duration,
    shared: Arc<RwLock<VendorMap>>,
    stop: Arc<AtomicBool>,
) {
    let initial_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
    watch_mtime(path, throttle, shared, stop, initial_mtime)
}

fn watch_inotify(
    path: PathBuf,
    throttle: Duration,
    shared: Arc<RwLock<VendorMap>>,
    stop: Arc<AtomicBool>,
) {
    use inotify::{Inotify, WatchMask};

    let Some(parent) = path.parent().map(Path::to_path_buf) else {
        warn!(path = ?path, "vendor map path has no parent, falling back to mtime polling");
        return watch_mtime_from_now(path, throttle, shared, stop);
    };

    let mut inotify = match Inotify::init() {
        Ok(inotify) => inotify,
        Err(e) => {
            warn!(error = %e, "inotify init failed, falling back to mtime polling");
            return watch_mtime_from_now(path, throttle, shared, stop);
        }
    };

    // Watch the parent so editors that replace the file are still seen.
    if let Err(e) = inotify.watches().add(
        &parent,
        WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO | WatchMask::CREATE,
    ) {
        warn!(error = %e, "inotify watch failed, falling back to mtime polling");
        return watch_mtime_from_now(path, throttle, shared, stop);
    }

    let file_name = path.file_name().map(|n| n.to_os_string());
    let mut buffer = [0u8; 4096];

    while !stop.load(Ordering::SeqCst) {
        match inotify.read_events(&mut buffer) {
            Ok(events) => {
                let relevant = events
                    .filter_map(|event| event.name.map(|n| n.to_os_string()))
                    .any(|name| Some(name) == file_name);
                if relevant {
                    reload_into(&path, &shared);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "inotify read failed, falling back to mtime polling");
                return watch_mtime_from_now(path, throttle, shared, stop);
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
}
