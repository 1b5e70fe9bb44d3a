//! Shared-memory telemetry publisher.
//!
//! Single writer, many readers. The daemon maps a POSIX shared-memory
//! object and overwrites it with a fixed header plus one complete JSON
//! document per publish; readers detect updates through the monotonically
//! increasing write index and never need a lock. When the object cannot be
//! created the publisher falls back to a plain JSON file that clients poll.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr;

use lfc_error::{LfcError, Result};
use lfc_protocol::shm::{normalize_shm_name, ShmHeader, SHM_CAPACITY_MIN, SHM_HEADER_LEN};
use lfc_protocol::TelemetrySnapshot;
use tracing::{debug, info, warn};

/// Where a publish physically lands.
enum Backing {
    Shm(ShmRegion),
    File(PathBuf),
}

pub struct TelemetryPublisher {
    backing: Backing,
    write_index: u32,
    capacity: usize,
}

impl TelemetryPublisher {
    /// Create the shared-memory object, or fall back to a file.
    pub fn new(shm_name: &str, fallback_path: &Path) -> Self {
        let capacity = SHM_CAPACITY_MIN;
        let name = normalize_shm_name(shm_name);

        match ShmRegion::create(&name, capacity) {
            Ok(region) => {
                info!(name = %name, capacity, "telemetry shared memory mapped");
                Self {
                    backing: Backing::Shm(region),
                    write_index: 0,
                    capacity,
                }
            }
            Err(e) => {
                // File fallback keeps telemetry.json and out-of-process
                // readers alive on systems without POSIX shm.
                warn!(name = %name, error = %e, fallback = ?fallback_path,
                      "shared memory unavailable, using file fallback");
                Self {
                    backing: Backing::File(fallback_path.to_path_buf()),
                    write_index: 0,
                    capacity,
                }
            }
        }
    }

    /// Fallback-only publisher (tests, `--shm_path ''`).
    pub fn file_only(fallback_path: &Path) -> Self {
        Self {
            backing: Backing::File(fallback_path.to_path_buf()),
            write_index: 0,
            capacity: SHM_CAPACITY_MIN,
        }
    }

    pub fn is_shm(&self) -> bool {
        matches!(self.backing, Backing::Shm(_))
    }

    pub fn write_index(&self) -> u32 {
        self.write_index
    }

    /// Publish one complete snapshot.
    pub fn publish(&mut self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot)?;
        let payload_capacity = self.capacity - SHM_HEADER_LEN;
        if json.len() + 1 > payload_capacity {
            return Err(LfcError::Unavailable(format!(
                "telemetry document of {} bytes exceeds capacity {}",
                json.len(),
                payload_capacity
            )));
        }

        self.write_index = self.write_index.wrapping_add(1);

        match &mut self.backing {
            Backing::Shm(region) => {
                let header = ShmHeader::new(
                    self.capacity as u32,
                    (json.len() + 1) as u32,
                    self.write_index,
                );
                // The complete buffer goes in with a single copy so a reader
                // sees either the previous or the new document, never a mix.
                let mut buffer = Vec::with_capacity(SHM_HEADER_LEN + json.len() + 1);
                buffer.extend_from_slice(&header.encode());
                buffer.extend_from_slice(&json);
                buffer.push(0);
                region.write(&buffer);
                Ok(())
            }
            Backing::File(path) => {
                // Plain JSON for polling readers; temp file + rename keeps
                // the document whole.
                let tmp = path.with_extension("tmp");
                fs::write(&tmp, &json)
                    .and_then(|_| fs::rename(&tmp, &path))
                    .map_err(|e| LfcError::Unavailable(format!("telemetry fallback: {}", e)))
            }
        }
    }
}

/// A mapped POSIX shared-memory object.
struct ShmRegion {
    name: CString,
    ptr: *mut u8,
    capacity: usize,
}

// The writer owns the only mutable handle on the mapping.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    fn create(name: &str, capacity: usize) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| LfcError::Unavailable("shm name contains NUL".to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; flags and mode
        // are plain constants.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o644 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(LfcError::Unavailable(format!(
                "shm_open({}): {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is a valid descriptor from shm_open.
        let truncated = unsafe { libc::ftruncate(fd, capacity as libc::off_t) };
        if truncated != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: fd is valid and owned here.
            unsafe { libc::close(fd) };
            return Err(LfcError::Unavailable(format!("ftruncate: {}", err)));
        }

        // SAFETY: fd is valid, capacity is the mapped length, and the
        // returned pointer is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The mapping keeps the object alive; the descriptor is not needed.
        // SAFETY: fd is valid and owned here.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(LfcError::Unavailable(format!(
                "mmap: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            name: c_name,
            ptr: ptr as *mut u8,
            capacity,
        })
    }

    fn write(&mut self, buffer: &[u8]) {
        debug_assert!(buffer.len() <= self.capacity);
        // SAFETY: ptr is a live MAP_SHARED mapping of self.capacity bytes
        // and buffer.len() is bounded by it.
        unsafe {
            ptr::copy_nonoverlapping(buffer.as_ptr(), self.ptr, buffer.len());
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity describe the mapping created in `create`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
        }
        // Leave the object in place for readers; a restarted daemon
        // re-opens it. Unlinking is only done on explicit request.
        debug!(name = ?self.name, "telemetry shared memory unmapped");
    }
}

/// Remove a shared-memory object by configured name (shutdown cleanup).
pub fn unlink_shm(shm_name: &str) {
    let name = normalize_shm_name(shm_name);
    if let Ok(c_name) = CString::new(name) {
        // SAFETY: c_name is a valid NUL-terminated string.
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfc_protocol::telemetry::HwmonTelemetry;
    use tempfile::TempDir;

    fn snapshot(timestamp_ms: u64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            version: 1,
            timestamp_ms,
            engine_enabled: false,
            tick_ms: 50,
            delta_c: 0.7,
            force_tick_ms: 2000,
            profile: None,
            hwmon: HwmonTelemetry::default(),
            gpus: Vec::new(),
            degraded_pwms: Vec::new(),
            detection: None,
        }
    }

    #[test]
    fn file_fallback_writes_whole_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("telemetry.json");
        let mut publisher = TelemetryPublisher::file_only(&path);

        publisher.publish(&snapshot(1)).unwrap();
        publisher.publish(&snapshot(2)).unwrap();
        assert_eq!(publisher.write_index(), 2);

        let parsed: TelemetrySnapshot =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.timestamp_ms, 2);
    }

    #[test]
    fn shm_roundtrip_when_available() {
        let name = format!("/lfc-test-{}", std::process::id());
        let mut publisher = {
            let dir = TempDir::new().unwrap();
            TelemetryPublisher::new(&name, &dir.path().join("fb.json"))
        };
        if !publisher.is_shm() {
            // No POSIX shm in this environment; the fallback path is
            // covered by the other test.
            return;
        }

        publisher.publish(&snapshot(7)).unwrap();

        let backing = PathBuf::from(format!("/dev/shm{}", name));
        let bytes = fs::read(&backing).unwrap();
        let header = ShmHeader::decode(&bytes).unwrap();
        assert_eq!(header.write_index, 1);
        assert_eq!(header.capacity as usize, SHM_CAPACITY_MIN);

        let payload = &bytes[SHM_HEADER_LEN..SHM_HEADER_LEN + header.slot_size as usize - 1];
        let parsed: TelemetrySnapshot = serde_json::from_slice(payload).unwrap();
        assert_eq!(parsed.timestamp_ms, 7);

        drop(publisher);
        unlink_shm(&name);
    }
}
