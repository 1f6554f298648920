//! Effective process profile composition.
//!
//! The base process profile is a flat JSON object. Request overrides are
//! written into a per-job copy; when that fails the job carries on with the
//! unmodified base profile.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Diagnostic;
use crate::settings::ProfileOverrides;

/// File name of the derived profile inside the work directory.
pub const EFFECTIVE_PROFILE_FILE: &str = "process_modified.json";

/// Process profile actually handed to the slicer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveProfile {
    /// Profile path.
    pub path: PathBuf,
    /// Whether this is a derived copy rather than the base profile.
    pub derived: bool,
}

impl EffectiveProfile {
    fn base(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            derived: false,
        }
    }
}

/// Append `%` to an infill density that lacks it.
pub fn normalize_infill(value: &str) -> String {
    if value.ends_with('%') {
        value.to_string()
    } else {
        format!("{value}%")
    }
}

/// Merges request overrides into a base process profile.
#[derive(Debug, Clone)]
pub struct ConfigComposer {
    overrides: ProfileOverrides,
}

impl ConfigComposer {
    /// Create a composer for one request's overrides.
    pub fn new(overrides: ProfileOverrides) -> Self {
        Self { overrides }
    }

    /// Produce the profile to slice with.
    ///
    /// A derived file is only written when slicing will happen and at least
    /// one override is active.
    pub fn compose(&self, base: &Path, needs_slicing: bool, out_dir: &Path) -> EffectiveProfile {
        if !needs_slicing || !self.overrides.is_active() {
            return EffectiveProfile::base(base);
        }

        info!("Creating modified process config...");
        match self.write_derived(base, out_dir) {
            Ok(path) => {
                info!(path = %path.display(), "Created modified process config");
                EffectiveProfile {
                    path,
                    derived: true,
                }
            }
            Err(diag) => {
                warn!(%diag, "Failed to create modified process config, falling back to original");
                EffectiveProfile::base(base)
            }
        }
    }

    /// Apply overrides in place. Support keys are only ever set, never removed.
    pub fn apply(&self, profile: &mut Map<String, Value>) {
        let o = &self.overrides;
        if o.enable_support {
            profile.insert("enable_support".into(), "1".into());
            profile.insert("support_type".into(), o.support_type.clone().into());
            profile.insert(
                "support_threshold_angle".into(),
                o.support_threshold_angle.clone().into(),
            );
            info!(support_type = %o.support_type, "Supports: enabled");
        }
        if let Some(walls) = &o.wall_loops {
            profile.insert("wall_loops".into(), walls.clone().into());
            info!(wall_loops = %walls, "Wall loops override");
        }
        if let Some(density) = &o.infill_density {
            let density = normalize_infill(density);
            info!(infill = %density, "Infill density override");
            profile.insert("sparse_infill_density".into(), density.into());
        }
    }

    fn write_derived(&self, base: &Path, out_dir: &Path) -> Result<PathBuf, Diagnostic> {
        let raw = std::fs::read_to_string(base)
            .map_err(|e| Diagnostic::new(format!("read {}", base.display()), e))?;
        let mut profile: Map<String, Value> = serde_json::from_str(&raw)
            .map_err(|e| Diagnostic::new(format!("parse {}", base.display()), e))?;

        self.apply(&mut profile);

        let path = out_dir.join(EFFECTIVE_PROFILE_FILE);
        write_pretty(&path, &profile)
            .map_err(|e| Diagnostic::new(format!("write {}", path.display()), e))?;

        debug!(
            keys = profile.len(),
            names = ?profile.keys().collect::<Vec<_>>(),
            "modified process config keys"
        );
        Ok(path)
    }
}

fn write_pretty(path: &Path, profile: &Map<String, Value>) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut ser =
        serde_json::Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(b"    "));
    profile.serialize(&mut ser)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_profile(dir: &Path) -> PathBuf {
        let path = dir.join("base.json");
        std::fs::write(
            &path,
            r#"{"name": "0.20mm Standard", "wall_loops": "2", "enable_support": "0", "sparse_infill_density": "15%"}"#,
        )
        .unwrap();
        path
    }

    fn read(path: &Path) -> Map<String, Value> {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_normalize_infill() {
        assert_eq!(normalize_infill("30"), "30%");
        assert_eq!(normalize_infill("30%"), "30%");
        assert_eq!(normalize_infill(&normalize_infill("7")), "7%");
    }

    #[test]
    fn test_derived_profile_written() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_profile(tmp.path());
        let composer = ConfigComposer::new(ProfileOverrides {
            wall_loops: Some("4".into()),
            infill_density: Some("30".into()),
            ..ProfileOverrides::default()
        });

        let effective = composer.compose(&base, true, tmp.path());
        assert!(effective.derived);
        assert_eq!(effective.path, tmp.path().join(EFFECTIVE_PROFILE_FILE));

        let profile = read(&effective.path);
        assert_eq!(profile["enable_support"], "1");
        assert_eq!(profile["support_type"], "tree(auto)");
        assert_eq!(profile["support_threshold_angle"], "30");
        assert_eq!(profile["wall_loops"], "4");
        assert_eq!(profile["sparse_infill_density"], "30%");
        assert_eq!(profile["name"], "0.20mm Standard");

        // Key order of the base profile survives.
        let keys: Vec<_> = profile.keys().take(2).cloned().collect();
        assert_eq!(keys, ["name", "wall_loops"]);
        // Four-space indentation.
        let text = std::fs::read_to_string(&effective.path).unwrap();
        assert!(text.contains("\n    \"name\""));
    }

    #[test]
    fn test_fractional_threshold_angle_kept_verbatim() {
        let composer = ConfigComposer::new(ProfileOverrides {
            support_threshold_angle: "30.5".into(),
            ..ProfileOverrides::default()
        });
        let mut profile = Map::new();
        composer.apply(&mut profile);
        assert_eq!(profile["support_threshold_angle"], "30.5");
    }

    #[test]
    fn test_support_keys_never_removed() {
        let composer = ConfigComposer::new(ProfileOverrides::default());
        let mut profile = Map::new();
        profile.insert("enable_support".into(), "1".into());
        profile.insert("support_type".into(), "normal(auto)".into());
        profile.insert("support_threshold_angle".into(), "45".into());
        profile.insert("support_on_build_plate_only".into(), "1".into());

        composer.apply(&mut profile);
        for key in [
            "enable_support",
            "support_type",
            "support_threshold_angle",
            "support_on_build_plate_only",
        ] {
            assert!(profile.contains_key(key), "{key} dropped");
        }
        assert_eq!(profile["enable_support"], "1");
    }

    #[test]
    fn test_no_derivation_without_slicing() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_profile(tmp.path());
        let composer = ConfigComposer::new(ProfileOverrides::default());

        let effective = composer.compose(&base, false, tmp.path());
        assert!(!effective.derived);
        assert_eq!(effective.path, base);
        assert!(!tmp.path().join(EFFECTIVE_PROFILE_FILE).exists());
    }

    #[test]
    fn test_no_derivation_without_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_profile(tmp.path());
        let composer = ConfigComposer::new(ProfileOverrides {
            enable_support: false,
            ..ProfileOverrides::default()
        });

        let effective = composer.compose(&base, true, tmp.path());
        assert_eq!(effective, EffectiveProfile::base(&base));
    }

    #[test]
    fn test_malformed_base_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("broken.json");
        std::fs::write(&base, "{ not json").unwrap();
        let composer = ConfigComposer::new(ProfileOverrides::default());

        let effective = composer.compose(&base, true, tmp.path());
        assert!(!effective.derived);
        assert_eq!(effective.path, base);

        let missing = tmp.path().join("missing.json");
        let effective = composer.compose(&missing, true, tmp.path());
        assert_eq!(effective.path, missing);
    }
}
