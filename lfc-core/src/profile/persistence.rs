//! JSON persistence for profiles.
//!
//! One file per profile at `<profilesDir>/<name>.json`. Saves go through a
//! temp file and an atomic rename so a crash mid-write cannot corrupt an
//! existing profile.

use std::fs;
use std::path::{Path, PathBuf};

use lfc_error::{LfcError, Result};
use tracing::{debug, info};

use super::types::Profile;

/// Characters allowed in a profile name (it becomes a file name).
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(LfcError::InvalidProfile(
            "profile name must be 1-128 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
    {
        return Err(LfcError::InvalidProfile(format!(
            "profile name '{}' contains unsupported characters",
            name
        )));
    }
    if name.starts_with('.') || name.contains("..") {
        return Err(LfcError::InvalidProfile(
            "profile name may not start with '.' or contain '..'".to_string(),
        ));
    }
    Ok(())
}

pub fn profile_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

/// Save a profile under its own name.
pub fn save_to_dir(profile: &Profile, dir: &Path) -> Result<PathBuf> {
    validate_name(&profile.name)?;
    fs::create_dir_all(dir).map_err(|e| LfcError::ProfileSave {
        name: profile.name.clone(),
        reason: format!("create {}: {}", dir.display(), e),
    })?;

    let target = profile_path(dir, &profile.name);
    let tmp = dir.join(format!(".{}.json.tmp", profile.name));
    let json = serde_json::to_string_pretty(profile)?;

    fs::write(&tmp, json.as_bytes()).map_err(|e| LfcError::ProfileSave {
        name: profile.name.clone(),
        reason: e.to_string(),
    })?;
    fs::rename(&tmp, &target).map_err(|e| LfcError::ProfileSave {
        name: profile.name.clone(),
        reason: e.to_string(),
    })?;

    info!(profile = %profile.name, path = ?target, "profile saved");
    Ok(target)
}

/// Load a profile by name.
pub fn load_from_dir(dir: &Path, name: &str) -> Result<Profile> {
    validate_name(name)?;
    let path = profile_path(dir, name);
    let content =
        fs::read_to_string(&path).map_err(|_| LfcError::ProfileNotFound(name.to_string()))?;
    let profile: Profile = serde_json::from_str(&content)?;
    debug!(profile = %profile.name, rules = profile.rules.len(), "profile loaded");
    Ok(profile)
}

/// List profile names present in the directory (sorted).
pub fn list_profiles(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let file_name = e.file_name().to_string_lossy().to_string();
                    let name = file_name.strip_suffix(".json")?;
                    if name.starts_with('.') {
                        return None;
                    }
                    Some(name.to_string())
                })
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Rename a profile on disk and inside the document.
pub fn rename_profile(dir: &Path, old_name: &str, new_name: &str) -> Result<Profile> {
    validate_name(new_name)?;
    let mut profile = load_from_dir(dir, old_name)?;
    if profile_path(dir, new_name).exists() {
        return Err(LfcError::ProfileSave {
            name: new_name.to_string(),
            reason: "a profile with that name already exists".to_string(),
        });
    }
    profile.name = new_name.to_string();
    save_to_dir(&profile, dir)?;
    fs::remove_file(profile_path(dir, old_name)).map_err(LfcError::Io)?;
    Ok(profile)
}

/// Delete a profile file.
pub fn delete_profile(dir: &Path, name: &str) -> Result<()> {
    validate_name(name)?;
    let path = profile_path(dir, name);
    if !path.exists() {
        return Err(LfcError::ProfileNotFound(name.to_string()));
    }
    fs::remove_file(&path).map_err(LfcError::Io)?;
    info!(profile = %name, "profile deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::types::{CurvePoint, Rule, Source, SourceSettings};
    use tempfile::TempDir;

    fn sample_profile(name: &str) -> Profile {
        let mut profile = Profile::new(name);
        profile.description = Some("front intake".to_string());
        profile.rules.push(Rule {
            pwm_path: PathBuf::from("/sys/class/hwmon/hwmon0/pwm1"),
            nickname: Some("front".to_string()),
            sources: vec![Source {
                temp_paths: vec![PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input")],
                points: vec![
                    CurvePoint { temp_c: 30.0, percent: 20.0 },
                    CurvePoint { temp_c: 60.0, percent: 80.0 },
                ],
                settings: SourceSettings {
                    hysteresis_c: 3.0,
                    ..SourceSettings::default()
                },
            }],
        });
        profile
    }

    #[test]
    fn save_load_roundtrip_is_field_order_agnostic() {
        let dir = TempDir::new().unwrap();
        let profile = sample_profile("quiet");
        let path = save_to_dir(&profile, dir.path()).unwrap();
        assert!(path.ends_with("quiet.json"));

        let loaded = load_from_dir(dir.path(), "quiet").unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn list_and_delete() {
        let dir = TempDir::new().unwrap();
        save_to_dir(&sample_profile("a"), dir.path()).unwrap();
        save_to_dir(&sample_profile("b"), dir.path()).unwrap();
        assert_eq!(list_profiles(dir.path()), vec!["a", "b"]);

        delete_profile(dir.path(), "a").unwrap();
        assert_eq!(list_profiles(dir.path()), vec!["b"]);
        assert!(matches!(
            delete_profile(dir.path(), "a"),
            Err(LfcError::ProfileNotFound(_))
        ));
    }

    #[test]
    fn rename_updates_document_name() {
        let dir = TempDir::new().unwrap();
        save_to_dir(&sample_profile("old"), dir.path()).unwrap();
        let renamed = rename_profile(dir.path(), "old", "new").unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(list_profiles(dir.path()), vec!["new"]);
    }

    #[test]
    fn rejects_traversal_names() {
        let dir = TempDir::new().unwrap();
        assert!(load_from_dir(dir.path(), "../etc/passwd").is_err());
        let mut bad = sample_profile("ok");
        bad.name = "..".to_string();
        assert!(save_to_dir(&bad, dir.path()).is_err());
    }

    #[test]
    fn missing_profile_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_from_dir(dir.path(), "ghost"),
            Err(LfcError::ProfileNotFound(_))
        ));
    }
}
