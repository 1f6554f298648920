//! Slicer command line construction.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::settings::{ProfilePaths, SlicerSettings};

/// Separator between entries of `--load-settings`.
pub const PATH_LIST_SEPARATOR: char = ';';

/// Environment forced on the slicer so it renders in software on an X11 display.
pub const HEADLESS_ENV: &[(&str, &str)] = &[
    ("LIBGL_ALWAYS_SOFTWARE", "1"),
    ("MESA_DEBUG", "silent"),
    ("XDG_SESSION_TYPE", "x11"),
    ("WAYLAND_DISPLAY", ""),
    ("GDK_BACKEND", "x11"),
    ("GLFW_IM_MODULE", ""),
    ("SDL_VIDEODRIVER", "x11"),
];

/// Kind of file handed to the slicer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Raw geometry (STL and friends).
    Geometry,
    /// A 3MF project archive.
    Archive,
}

impl InputKind {
    /// Detect from the file extension.
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("3mf") => Self::Archive,
            _ => Self::Geometry,
        }
    }

    /// Archives are assumed to be oriented already.
    pub fn auto_orient(self) -> bool {
        matches!(self, Self::Geometry)
    }
}

/// Output locations requested from the slicer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceTargets {
    /// Archive to export.
    pub archive: PathBuf,
    /// Slice-data directory.
    pub slice_data_dir: PathBuf,
}

impl SliceTargets {
    /// Settings export written into the slice-data directory.
    pub fn settings_export(&self) -> PathBuf {
        self.slice_data_dir.join("settings.json")
    }
}

/// Fully resolved slicer command. Built once per job and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceInvocation {
    /// Program to execute (the display wrapper when one is configured).
    pub program: String,
    /// Arguments, the input file last.
    pub args: Vec<String>,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl SliceInvocation {
    /// Build the slicer command for one job.
    pub fn build(
        slicer: &SlicerSettings,
        profiles: &ProfilePaths,
        process_profile: &Path,
        targets: &SliceTargets,
        input: &Path,
    ) -> Self {
        let kind = InputKind::of(input);
        let flag = |on: bool| if on { "1" } else { "0" };
        let exe = slicer.executable.display().to_string();

        let mut command: Vec<String> = Vec::new();
        if let Some(wrapper) = &slicer.display_wrapper {
            command.push(wrapper.program.clone());
            command.extend(wrapper.args.iter().cloned());
        }
        command.push(exe);
        command.extend([
            format!("--orient={}", flag(kind.auto_orient())),
            "--arrange=1".to_string(),
            format!(
                "--load-settings={}{PATH_LIST_SEPARATOR}{}",
                profiles.machine.display(),
                process_profile.display()
            ),
            format!("--load-filaments={}", profiles.filament.display()),
            format!("--export-3mf={}", targets.archive.display()),
            format!("--export-slicedata={}", targets.slice_data_dir.display()),
            format!("--export-settings={}", targets.settings_export().display()),
            "--slice=1".to_string(),
            "--min-save".to_string(),
            input.display().to_string(),
        ]);

        let program = command.remove(0);
        Self {
            program,
            args: command,
            env: HEADLESS_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Create a `tokio` command for this invocation.
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

impl fmt::Display for SliceInvocation {
    /// Shell-like rendering for logs; arguments with spaces are quoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = |s: &str| {
            if s.contains(' ') {
                format!("\"{s}\"")
            } else {
                s.to_string()
            }
        };
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}
