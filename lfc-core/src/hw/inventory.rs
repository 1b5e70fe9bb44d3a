//! Hardware inventory for hwmon devices.
//!
//! Discovery walks `/sys/class/hwmon/hwmonN` once at startup (and again only
//! on explicit request), collecting chips with their temperature inputs, fan
//! tachs, and PWM outputs. Value refresh afterwards is O(existing entries):
//! it re-reads registered files, drops entries whose backing file vanished,
//! and never adds new ones.

use std::fs;
use std::path::{Path, PathBuf};

use lfc_error::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::constants::{paths, pwm};
use crate::hw::access;

/// A hwmon chip with its identity metadata.
///
/// Immutable for the process lifetime unless re-discovery is requested.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Chip {
    pub hwmon_path: PathBuf,
    /// Contents of the `name` file (the kernel driver's self-reported name)
    pub driver_name: String,
    /// Driver name qualified with the bus token of the backing device
    pub chip_name: String,
    /// Filled by the vendor mapping after discovery
    pub vendor_label: Option<String>,
    pub vendor_class: Option<String>,
    pub aliases: Vec<String>,
}

/// Temperature input, unique by `input_path`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TempInput {
    pub chip_path: PathBuf,
    pub input_path: PathBuf,
    pub label: Option<String>,
    pub current_c: Option<f64>,
}

/// Fan tachometer input, unique by `input_path`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FanInput {
    pub chip_path: PathBuf,
    pub input_path: PathBuf,
    pub label: Option<String>,
    pub rpm: Option<u32>,
}

/// PWM output with paired metadata
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PwmOutput {
    pub chip_path: PathBuf,
    pub pwm_path: PathBuf,
    pub enable_path: Option<PathBuf>,
    pub pwm_max: u32,
    pub label: Option<String>,
    pub raw_value: Option<u32>,
    pub percent: Option<u8>,
    pub enable_mode: Option<u8>,
    /// Reading of the same-numbered tach on the same chip, when present
    pub rpm: Option<u32>,
}

/// The complete discovered inventory.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct Inventory {
    pub chips: Vec<Chip>,
    pub temps: Vec<TempInput>,
    pub fans: Vec<FanInput>,
    pub pwms: Vec<PwmOutput>,
}

impl Inventory {
    pub fn temp_by_path(&self, path: &Path) -> Option<&TempInput> {
        self.temps.iter().find(|t| t.input_path == path)
    }

    pub fn fan_by_path(&self, path: &Path) -> Option<&FanInput> {
        self.fans.iter().find(|f| f.input_path == path)
    }

    pub fn pwm_by_path(&self, path: &Path) -> Option<&PwmOutput> {
        self.pwms.iter().find(|p| p.pwm_path == path)
    }

    pub fn pwm_by_path_mut(&mut self, path: &Path) -> Option<&mut PwmOutput> {
        self.pwms.iter_mut().find(|p| p.pwm_path == path)
    }

    pub fn chip_by_path(&self, path: &Path) -> Option<&Chip> {
        self.chips.iter().find(|c| c.hwmon_path == path)
    }

    /// Tachs living on the same chip as the given PWM.
    pub fn tachs_on_chip<'a>(&'a self, chip_path: &'a Path) -> impl Iterator<Item = &'a FanInput> {
        self.fans.iter().filter(move |f| f.chip_path == chip_path)
    }
}

/// Discover the inventory under the default hwmon base.
pub fn discover() -> Result<Inventory> {
    discover_at(Path::new(paths::HWMON_BASE))
}

/// Discover the inventory under an explicit root (tests use a fake tree).
pub fn discover_at(root: &Path) -> Result<Inventory> {
    let mut inventory = Inventory::default();

    if !root.is_dir() {
        debug!(path = ?root, "hwmon base not present");
        return Ok(inventory);
    }

    let mut chip_dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("hwmon"))
                .unwrap_or(false)
        })
        .collect();
    chip_dirs.sort();

    for chip_dir in chip_dirs {
        read_chip(&chip_dir, &mut inventory)?;
    }

    info!(
        chips = inventory.chips.len(),
        temps = inventory.temps.len(),
        fans = inventory.fans.len(),
        pwms = inventory.pwms.len(),
        "hwmon discovery complete"
    );
    Ok(inventory)
}

fn read_chip(chip_dir: &Path, inventory: &mut Inventory) -> Result<()> {
    let driver_name = match fs::read_to_string(chip_dir.join("name")) {
        Ok(name) => name.trim().to_string(),
        Err(_) => chip_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string(),
    };

    let device_token = resolve_device_token(chip_dir);
    let chip_name = match &device_token {
        Some(token) => format!("{}@{}", driver_name, token),
        None => driver_name.clone(),
    };

    let mut aliases = vec![driver_name.clone()];
    if let Some(token) = &device_token {
        aliases.push(token.clone());
    }
    if let Some(driver) = read_uevent_driver(chip_dir) {
        if !aliases.contains(&driver) {
            aliases.push(driver);
        }
    }

    trace!(chip = %chip_name, path = ?chip_dir, "reading hwmon chip");

    let mut file_names: Vec<String> = fs::read_dir(chip_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    file_names.sort();

    let mut found_any = false;
    for file_name in &file_names {
        if file_name.starts_with("temp") && file_name.ends_with("_input") {
            inventory.temps.push(read_temp_input(chip_dir, file_name));
            found_any = true;
        } else if file_name.starts_with("fan") && file_name.ends_with("_input") {
            inventory.fans.push(read_fan_input(chip_dir, file_name));
            found_any = true;
        } else if file_name.starts_with("pwm")
            && file_name.len() > 3
            && !file_name.contains('_')
            && file_name[3..].chars().all(|c| c.is_ascii_digit())
        {
            inventory.pwms.push(read_pwm_output(chip_dir, file_name));
            found_any = true;
        }
    }

    if !found_any {
        trace!(path = ?chip_dir, "skipped chip without sensors");
        return Ok(());
    }

    // Pair each pwmN with the fanN tach on the same chip.
    pair_pwm_tachs(inventory, chip_dir);

    inventory.chips.push(Chip {
        hwmon_path: chip_dir.to_path_buf(),
        driver_name,
        chip_name,
        vendor_label: None,
        vendor_class: None,
        aliases,
    });
    Ok(())
}

/// Basename of the resolved `device/` symlink, e.g. a PCI BDF or a
/// platform device token.
fn resolve_device_token(chip_dir: &Path) -> Option<String> {
    let device = chip_dir.join("device");
    let resolved = fs::canonicalize(&device).ok()?;
    resolved
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

fn read_uevent_driver(chip_dir: &Path) -> Option<String> {
    let uevent = fs::read_to_string(chip_dir.join("device").join("uevent")).ok()?;
    uevent
        .lines()
        .find_map(|l| l.strip_prefix("DRIVER=").map(|d| d.trim().to_string()))
}

fn read_label(chip_dir: &Path, base_name: &str) -> Option<String> {
    fs::read_to_string(chip_dir.join(format!("{}_label", base_name)))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_temp_input(chip_dir: &Path, input_file: &str) -> TempInput {
    let input_path = chip_dir.join(input_file);
    let base_name = input_file.trim_end_matches("_input");
    TempInput {
        chip_path: chip_dir.to_path_buf(),
        current_c: access::read_temp_c(&input_path).ok(),
        label: read_label(chip_dir, base_name),
        input_path,
    }
}

fn read_fan_input(chip_dir: &Path, input_file: &str) -> FanInput {
    let input_path = chip_dir.join(input_file);
    let base_name = input_file.trim_end_matches("_input");
    FanInput {
        chip_path: chip_dir.to_path_buf(),
        rpm: access::read_rpm(&input_path).ok(),
        label: read_label(chip_dir, base_name),
        input_path,
    }
}

fn read_pwm_output(chip_dir: &Path, pwm_file: &str) -> PwmOutput {
    let pwm_path = chip_dir.join(pwm_file);
    let enable_candidate = chip_dir.join(format!("{}_enable", pwm_file));
    let enable_path = enable_candidate.exists().then_some(enable_candidate);

    let pwm_max = fs::read_to_string(chip_dir.join(format!("{}_max", pwm_file)))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(pwm::DEFAULT_MAX);

    let raw_value = access::read_raw(&pwm_path).ok();
    let enable_mode = enable_path.as_deref().and_then(|p| access::read_enable(p).ok());

    PwmOutput {
        chip_path: chip_dir.to_path_buf(),
        percent: raw_value.map(|raw| pwm::to_percent(raw, pwm_max)),
        label: read_label(chip_dir, pwm_file),
        rpm: None,
        raw_value,
        enable_mode,
        enable_path,
        pwm_max,
        pwm_path,
    }
}

fn pair_pwm_tachs(inventory: &mut Inventory, chip_dir: &Path) {
    let tach_rpms: Vec<(String, Option<u32>)> = inventory
        .fans
        .iter()
        .filter(|f| f.chip_path == chip_dir)
        .filter_map(|f| {
            let name = f.input_path.file_name()?.to_str()?;
            let index = name
                .trim_start_matches("fan")
                .trim_end_matches("_input")
                .to_string();
            Some((index, f.rpm))
        })
        .collect();

    for pwm_out in inventory
        .pwms
        .iter_mut()
        .filter(|p| p.chip_path == chip_dir)
    {
        let Some(name) = pwm_out.pwm_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let index = name.trim_start_matches("pwm");
        if let Some((_, rpm)) = tach_rpms.iter().find(|(i, _)| i == index) {
            pwm_out.rpm = *rpm;
        }
    }
}

/// Re-read values for every registered entry.
///
/// Entries whose backing file vanished are dropped; nothing is added. A
/// read that fails for any other reason leaves the entry present with its
/// value set to unavailable.
pub fn refresh_values(inventory: &mut Inventory) {
    inventory.temps.retain_mut(|temp| {
        if !temp.input_path.exists() {
            debug!(path = ?temp.input_path, "temp input vanished");
            return false;
        }
        temp.current_c = access::read_temp_c(&temp.input_path).ok();
        true
    });

    inventory.fans.retain_mut(|fan| {
        if !fan.input_path.exists() {
            debug!(path = ?fan.input_path, "fan input vanished");
            return false;
        }
        fan.rpm = access::read_rpm(&fan.input_path).ok();
        true
    });

    inventory.pwms.retain_mut(|pwm_out| {
        if !pwm_out.pwm_path.exists() {
            debug!(path = ?pwm_out.pwm_path, "pwm output vanished");
            return false;
        }
        pwm_out.raw_value = access::read_raw(&pwm_out.pwm_path).ok();
        pwm_out.percent = pwm_out
            .raw_value
            .map(|raw| pwm::to_percent(raw, pwm_out.pwm_max));
        pwm_out.enable_mode = pwm_out
            .enable_path
            .as_deref()
            .and_then(|p| access::read_enable(p).ok());
        true
    });

    // Re-pair tach readings after both lists settled.
    let chip_paths: Vec<PathBuf> = inventory.chips.iter().map(|c| c.hwmon_path.clone()).collect();
    for chip_path in chip_paths {
        pair_pwm_tachs(inventory, &chip_path);
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! Builders for fake hwmon trees used across the workspace test suites.

    use std::fs;
    use std::path::{Path, PathBuf};

    pub struct FakeChip<'a> {
        pub name: &'a str,
        pub temps: &'a [(u32, &'a str, i64)],
        pub fans: &'a [(u32, u32)],
        pub pwms: &'a [(u32, u32, Option<u8>)],
    }

    pub fn write_chip(root: &Path, index: u32, chip: &FakeChip<'_>) -> PathBuf {
        let dir = root.join(format!("hwmon{}", index));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", chip.name)).unwrap();
        for (n, label, millidegrees) in chip.temps {
            fs::write(dir.join(format!("temp{}_input", n)), format!("{}\n", millidegrees))
                .unwrap();
            if !label.is_empty() {
                fs::write(dir.join(format!("temp{}_label", n)), format!("{}\n", label)).unwrap();
            }
        }
        for (n, rpm) in chip.fans {
            fs::write(dir.join(format!("fan{}_input", n)), format!("{}\n", rpm)).unwrap();
        }
        for (n, raw, enable) in chip.pwms {
            fs::write(dir.join(format!("pwm{}", n)), format!("{}\n", raw)).unwrap();
            if let Some(mode) = enable {
                fs::write(dir.join(format!("pwm{}_enable", n)), format!("{}\n", mode)).unwrap();
            }
        }
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{write_chip, FakeChip};
    use super::*;
    use tempfile::TempDir;

    fn standard_tree(root: &Path) -> PathBuf {
        write_chip(
            root,
            0,
            &FakeChip {
                name: "nct6799",
                temps: &[(1, "SYSTIN", 38000), (2, "CPUTIN", 52000)],
                fans: &[(1, 820), (2, 1100)],
                pwms: &[(1, 128, Some(5)), (2, 255, None)],
            },
        )
    }

    #[test]
    fn discovery_collects_everything() {
        let dir = TempDir::new().unwrap();
        standard_tree(dir.path());

        let inv = discover_at(dir.path()).unwrap();
        assert_eq!(inv.chips.len(), 1);
        assert_eq!(inv.temps.len(), 2);
        assert_eq!(inv.fans.len(), 2);
        assert_eq!(inv.pwms.len(), 2);

        let chip = &inv.chips[0];
        assert_eq!(chip.driver_name, "nct6799");
        assert!(chip.aliases.contains(&"nct6799".to_string()));

        let cpu_temp = inv
            .temps
            .iter()
            .find(|t| t.label.as_deref() == Some("CPUTIN"))
            .unwrap();
        assert_eq!(cpu_temp.current_c, Some(52.0));

        let pwm1 = &inv.pwms[0];
        assert_eq!(pwm1.raw_value, Some(128));
        assert_eq!(pwm1.percent, Some(50));
        assert_eq!(pwm1.enable_mode, Some(5));
        assert_eq!(pwm1.rpm, Some(820)); // paired with fan1

        let pwm2 = &inv.pwms[1];
        assert!(pwm2.enable_path.is_none());
        assert_eq!(pwm2.percent, Some(100));
        assert_eq!(pwm2.rpm, Some(1100));
    }

    #[test]
    fn out_of_domain_temp_reads_unavailable() {
        let dir = TempDir::new().unwrap();
        write_chip(
            dir.path(),
            0,
            &FakeChip {
                name: "broken",
                temps: &[(1, "", 250_000)],
                fans: &[],
                pwms: &[],
            },
        );
        let inv = discover_at(dir.path()).unwrap();
        assert_eq!(inv.temps[0].current_c, None);
    }

    #[test]
    fn refresh_updates_and_drops_but_never_adds() {
        let dir = TempDir::new().unwrap();
        let chip_dir = standard_tree(dir.path());

        let mut inv = discover_at(dir.path()).unwrap();

        fs::write(chip_dir.join("temp2_input"), "61000\n").unwrap();
        fs::remove_file(chip_dir.join("fan2_input")).unwrap();
        // A file appearing after discovery must not be picked up.
        fs::write(chip_dir.join("temp3_input"), "40000\n").unwrap();

        refresh_values(&mut inv);
        assert_eq!(inv.temps.len(), 2);
        assert_eq!(
            inv.temps
                .iter()
                .find(|t| t.label.as_deref() == Some("CPUTIN"))
                .unwrap()
                .current_c,
            Some(61.0)
        );
        assert_eq!(inv.fans.len(), 1);
        assert_eq!(inv.pwms.len(), 2);
    }

    #[test]
    fn lookup_by_path() {
        let dir = TempDir::new().unwrap();
        let chip_dir = standard_tree(dir.path());
        let inv = discover_at(dir.path()).unwrap();

        assert!(inv.temp_by_path(&chip_dir.join("temp1_input")).is_some());
        assert!(inv.pwm_by_path(&chip_dir.join("pwm1")).is_some());
        assert!(inv.pwm_by_path(&chip_dir.join("pwm9")).is_none());
        assert_eq!(inv.tachs_on_chip(&chip_dir).count(), 2);
    }
}
