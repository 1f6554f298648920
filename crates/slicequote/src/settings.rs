//! Job configuration.
//!
//! Everything a job needs is carried in [`Settings`], built once at startup.
//! Nothing in this crate reads the process environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

/// Default machine profile file name.
pub const DEFAULT_MACHINE_PROFILE: &str = "Bambu Lab X1 Carbon 0.4 nozzle.json";
/// Default process profile file name.
pub const DEFAULT_PROCESS_PROFILE: &str = "0.20mm Standard @BBL X1C.json";
/// Default filament profile file name.
pub const DEFAULT_FILAMENT_PROFILE: &str = "Bambu PLA Basic @BBL X1C.json";
/// Support type forced whenever slicing happens.
pub const SUPPORT_TYPE: &str = "tree(auto)";

/// Where slicing profiles are loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    /// Profiles bundled with the slicer, fully resolved.
    System {
        /// Root of the vendor profile tree (contains `machine/`, `process/`, `filament/`).
        root: PathBuf,
    },
    /// Custom profiles under the config directory.
    Custom,
}

impl Default for ProfileSource {
    fn default() -> Self {
        Self::System {
            root: PathBuf::from("/opt/bambustudio/resources/profiles/BBL"),
        }
    }
}

/// Profile file names chosen for this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSelection {
    /// Machine profile file name.
    #[serde(rename = "printerMachine")]
    pub machine: String,
    /// Process profile file name.
    #[serde(rename = "printQuality")]
    pub process: String,
    /// Filament profile file name.
    #[serde(rename = "filament")]
    pub filament: String,
}

impl Default for ProfileSelection {
    fn default() -> Self {
        Self {
            machine: DEFAULT_MACHINE_PROFILE.into(),
            process: DEFAULT_PROCESS_PROFILE.into(),
            filament: DEFAULT_FILAMENT_PROFILE.into(),
        }
    }
}

/// Fully resolved profile paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePaths {
    /// Machine profile.
    pub machine: PathBuf,
    /// Process profile.
    pub process: PathBuf,
    /// Filament profile.
    pub filament: PathBuf,
}

/// Request-scoped changes applied to the base process profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOverrides {
    /// Enable support generation.
    pub enable_support: bool,
    /// Support type (e.g. `tree(auto)`).
    pub support_type: String,
    /// Support overhang threshold angle (degrees), written to the profile verbatim.
    pub support_threshold_angle: String,
    /// Wall loop count, verbatim.
    pub wall_loops: Option<String>,
    /// Sparse infill density, with or without a trailing `%`.
    pub infill_density: Option<String>,
}

impl Default for ProfileOverrides {
    fn default() -> Self {
        Self {
            enable_support: true,
            support_type: SUPPORT_TYPE.into(),
            support_threshold_angle: "30".into(),
            wall_loops: None,
            infill_density: None,
        }
    }
}

impl ProfileOverrides {
    /// Whether any override would change the base profile.
    pub fn is_active(&self) -> bool {
        self.enable_support || self.wall_loops.is_some() || self.infill_density.is_some()
    }
}

/// Program that provides a virtual display for the slicer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayWrapper {
    /// Wrapper program.
    pub program: String,
    /// Arguments placed before the wrapped command.
    pub args: Vec<String>,
}

impl DisplayWrapper {
    /// `xvfb-run` with an automatically chosen server number.
    pub fn xvfb(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![
                "--auto-servernum".into(),
                "--server-args=-screen 0 1024x768x24".into(),
            ],
        }
    }
}

impl Default for DisplayWrapper {
    fn default() -> Self {
        Self::xvfb("xvfb-run")
    }
}

/// External slicer process settings.
#[derive(Debug, Clone)]
pub struct SlicerSettings {
    /// Slicer executable.
    pub executable: PathBuf,
    /// Virtual display wrapper, if any.
    pub display_wrapper: Option<DisplayWrapper>,
    /// Maximum time the slicer may run.
    pub timeout: Duration,
    /// Time allowed to drain output after a forced kill.
    pub kill_grace: Duration,
    /// Monitor wake-up interval.
    pub monitor_tick: Duration,
    /// Interval between monitor progress reports.
    pub progress_interval: Duration,
    /// Run the display and rendering probes before launching.
    pub run_probes: bool,
}

impl Default for SlicerSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/opt/bambustudio/AppRun"),
            display_wrapper: Some(DisplayWrapper::default()),
            timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
            monitor_tick: Duration::from_millis(500),
            progress_interval: Duration::from_secs(10),
            run_probes: true,
        }
    }
}

/// Filament pricing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    /// Price of one spool.
    pub filament_price_per_spool: f64,
    /// Spool weight (g).
    pub spool_weight_grams: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            filament_price_per_spool: 12.0,
            spool_weight_grams: 1000.0,
        }
    }
}

/// Complete configuration of one job.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Config root; the work directory lives under it.
    pub config_dir: PathBuf,
    /// Profile source.
    pub profile_source: ProfileSource,
    /// Profile file names.
    pub profiles: ProfileSelection,
    /// Process profile overrides.
    pub overrides: ProfileOverrides,
    /// Slicer process settings.
    pub slicer: SlicerSettings,
    /// Work directories older than this are swept at startup.
    pub cleanup_age: Duration,
    /// Filament pricing.
    pub pricing: Pricing,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/config"),
            profile_source: ProfileSource::default(),
            profiles: ProfileSelection::default(),
            overrides: ProfileOverrides::default(),
            slicer: SlicerSettings::default(),
            cleanup_age: Duration::from_secs(3600),
            pricing: Pricing::default(),
        }
    }
}

impl Settings {
    /// Base directory holding one subdirectory per request.
    pub fn work_base(&self) -> PathBuf {
        self.config_dir.join("work")
    }

    /// Resolve the selected profile names into full paths.
    pub fn profile_paths(&self) -> ProfilePaths {
        let (machine_dir, process_dir, filament_dir) = self.profile_dirs();
        ProfilePaths {
            machine: machine_dir.join(&self.profiles.machine),
            process: process_dir.join(&self.profiles.process),
            filament: filament_dir.join(&self.profiles.filament),
        }
    }

    fn profile_dirs(&self) -> (PathBuf, PathBuf, PathBuf) {
        match &self.profile_source {
            ProfileSource::System { root } => (
                root.join("machine"),
                root.join("process"),
                root.join("filament"),
            ),
            // The deployed custom layout keeps machine profiles in `process_config`
            // and process profiles in `printer_config`.
            ProfileSource::Custom => {
                let dir = |name: &str| -> PathBuf { Path::new(&self.config_dir).join(name) };
                (
                    dir("process_config"),
                    dir("printer_config"),
                    dir("filament_config"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_profile_paths() {
        let settings = Settings {
            profile_source: ProfileSource::System {
                root: PathBuf::from("/profiles/BBL"),
            },
            ..Settings::default()
        };
        let paths = settings.profile_paths();
        assert_eq!(
            paths.machine,
            PathBuf::from("/profiles/BBL/machine").join(DEFAULT_MACHINE_PROFILE)
        );
        assert_eq!(
            paths.process,
            PathBuf::from("/profiles/BBL/process").join(DEFAULT_PROCESS_PROFILE)
        );
        assert_eq!(
            paths.filament,
            PathBuf::from("/profiles/BBL/filament").join(DEFAULT_FILAMENT_PROFILE)
        );
    }

    #[test]
    fn test_custom_profile_paths_keep_deployed_layout() {
        let settings = Settings {
            config_dir: PathBuf::from("/cfg"),
            profile_source: ProfileSource::Custom,
            ..Settings::default()
        };
        let paths = settings.profile_paths();
        assert!(paths.machine.starts_with("/cfg/process_config"));
        assert!(paths.process.starts_with("/cfg/printer_config"));
        assert!(paths.filament.starts_with("/cfg/filament_config"));
        assert_eq!(settings.work_base(), PathBuf::from("/cfg/work"));
    }

    #[test]
    fn test_support_counts_as_active_override() {
        let overrides = ProfileOverrides::default();
        assert!(overrides.is_active());

        let none = ProfileOverrides {
            enable_support: false,
            ..ProfileOverrides::default()
        };
        assert!(!none.is_active());
    }
}
