//! slicequote CLI - price a print by slicing it with Bambu Studio
//!
//! Prints `RESULT_JSON:{...}` and `Total Cost: <n>` on stdout and exits 0 on
//! success. Logs go to stderr. Any failure exits 1.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use slicequote::settings::{
    DEFAULT_FILAMENT_PROFILE, DEFAULT_MACHINE_PROFILE, DEFAULT_PROCESS_PROFILE,
};
use slicequote::{
    DisplayWrapper, Job, Pricing, ProfileOverrides, ProfileSelection, ProfileSource, RequestId,
    Settings, SlicerSettings,
};
use tracing::error;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "slicequote")]
#[command(about = "Slice a model with Bambu Studio and estimate its print cost", long_about = None)]
struct Cli {
    /// Model (.stl) or project (.3mf) to price
    input: PathBuf,

    /// Request identifier; generated when omitted
    request_id: Option<String>,

    /// Config root; work directories live in `<config>/work`
    #[arg(long, env = "CONFIG_DIR", default_value = "/config")]
    config_dir: PathBuf,

    /// Load profiles from the slicer's bundled tree instead of the config root
    #[arg(
        long,
        env = "USE_SYSTEM_PROFILES",
        default_value = "1",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    use_system_profiles: bool,

    /// Root of the bundled profile tree
    #[arg(
        long,
        env = "SYSTEM_PROFILES_DIR",
        default_value = "/opt/bambustudio/resources/profiles/BBL"
    )]
    system_profiles_dir: PathBuf,

    /// Machine profile file name
    #[arg(long, env = "PRINTER_MACHINE_NAME", default_value = DEFAULT_MACHINE_PROFILE)]
    printer_machine_name: String,

    /// Process profile file name
    #[arg(long, env = "PRINT_QUALITY_NAME", default_value = DEFAULT_PROCESS_PROFILE)]
    print_quality_name: String,

    /// Filament profile file name
    #[arg(long, env = "FILAMENT_CONFIG_NAME", default_value = DEFAULT_FILAMENT_PROFILE)]
    filament_config_name: String,

    /// Wall loop count override
    #[arg(long, env = "WALL_LOOPS")]
    wall_loops: Option<String>,

    /// Sparse infill density override (`15` or `15%`)
    #[arg(long, env = "INFILL_DENSITY")]
    infill_density: Option<String>,

    /// Support threshold angle (degrees)
    #[arg(
        long,
        env = "SUPPORT_THRESHOLD_ANGLE",
        default_value = "30",
        value_parser = parse_angle
    )]
    support_threshold_angle: String,

    /// Slicer timeout (seconds)
    #[arg(long, env = "BAMBU_SLICE_TIMEOUT", default_value_t = 120)]
    slice_timeout: u64,

    /// Work directories older than this are removed at startup (seconds)
    #[arg(long, env = "CLEANUP_AGE_SECONDS", default_value_t = 3600)]
    cleanup_age_seconds: u64,

    /// Price of one filament spool
    #[arg(long, env = "FILAMENT_PRICE", default_value_t = 12.0)]
    filament_price: f64,

    /// Filament weight of one spool (g)
    #[arg(long, env = "SPOOL_WEIGHT_GRAMS", default_value_t = 1000.0)]
    spool_weight_grams: f64,

    /// Slicer executable
    #[arg(long, env = "BAMBU_STUDIO_EXE", default_value = "/opt/bambustudio/AppRun")]
    bambu_studio_exe: PathBuf,

    /// Virtual display wrapper; empty runs the slicer directly
    #[arg(long, env = "DISPLAY_WRAPPER", default_value = "xvfb-run")]
    display_wrapper: String,

    /// Run the slicer without a virtual display wrapper
    #[arg(long, default_value_t = false)]
    no_display_wrapper: bool,

    /// Skip the display and rendering probes
    #[arg(long, env = "SKIP_PROBES", default_value_t = false)]
    skip_probes: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        let profile_source = if self.use_system_profiles {
            ProfileSource::System {
                root: self.system_profiles_dir.clone(),
            }
        } else {
            ProfileSource::Custom
        };
        let wrapper = self.display_wrapper.trim();
        let display_wrapper = (!self.no_display_wrapper && !wrapper.is_empty())
            .then(|| DisplayWrapper::xvfb(wrapper));

        Settings {
            config_dir: self.config_dir.clone(),
            profile_source,
            profiles: ProfileSelection {
                machine: self.printer_machine_name.clone(),
                process: self.print_quality_name.clone(),
                filament: self.filament_config_name.clone(),
            },
            overrides: ProfileOverrides {
                support_threshold_angle: self.support_threshold_angle.clone(),
                wall_loops: non_empty(self.wall_loops.as_deref()),
                infill_density: non_empty(self.infill_density.as_deref()),
                ..ProfileOverrides::default()
            },
            slicer: SlicerSettings {
                executable: self.bambu_studio_exe.clone(),
                display_wrapper,
                timeout: Duration::from_secs(self.slice_timeout),
                run_probes: !self.skip_probes,
                ..SlicerSettings::default()
            },
            cleanup_age: Duration::from_secs(self.cleanup_age_seconds),
            pricing: Pricing {
                filament_price_per_spool: self.filament_price,
                spool_weight_grams: self.spool_weight_grams,
            },
        }
    }

    fn request_id(&self) -> slicequote::Result<RequestId> {
        match self.request_id.as_deref() {
            Some(raw) => RequestId::parse(raw),
            None => Ok(RequestId::generate()),
        }
    }
}

/// Accept any finite number and keep its text as given.
fn parse_angle(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(angle) if angle.is_finite() => Ok(trimmed.to_string()),
        _ => Err(format!("`{raw}` is not an angle in degrees")),
    }
}

/// Help and version output succeed; every other parse error is a failure.
fn parse_exit_code(err: &clap::Error) -> ExitCode {
    if err.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if let Err(io) = e.print() {
                eprintln!("{e}: {io}");
            }
            return Ok(parse_exit_code(&e));
        }
    };
    let settings = cli.settings();
    let request_id = cli.request_id();

    let debug_dir = request_id
        .as_ref()
        .ok()
        .map(|id| settings.work_base().join(id.as_str()));
    logging::init(debug_dir)?;

    let request_id = match request_id {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "rejected request");
            return Ok(ExitCode::FAILURE);
        }
    };

    let job = Job::new(settings, cli.input, Some(request_id));
    match job.run(&mut std::io::stdout()).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("slicequote").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_custom_profiles_and_overrides() {
        let cli = parse(&[
            "part.stl",
            "req-1",
            "--use-system-profiles",
            "0",
            "--config-dir",
            "/srv/config",
            "--wall-loops",
            "3",
            "--infill-density",
            "  ",
            "--slice-timeout",
            "45",
            "--filament-price",
            "20",
        ]);
        let settings = cli.settings();

        assert_eq!(settings.profile_source, ProfileSource::Custom);
        assert_eq!(settings.work_base(), PathBuf::from("/srv/config/work"));
        assert_eq!(settings.overrides.wall_loops.as_deref(), Some("3"));
        assert_eq!(settings.overrides.infill_density, None);
        assert_eq!(settings.slicer.timeout, Duration::from_secs(45));
        assert_eq!(settings.pricing.filament_price_per_spool, 20.0);
        assert_eq!(cli.request_id().unwrap().as_str(), "req-1");
    }

    #[test]
    fn test_display_wrapper_switches() {
        let cli = parse(&["part.stl", "--display-wrapper", ""]);
        assert_eq!(cli.settings().slicer.display_wrapper, None);

        let cli = parse(&["part.stl", "--no-display-wrapper"]);
        assert_eq!(cli.settings().slicer.display_wrapper, None);

        let cli = parse(&["part.stl", "--display-wrapper", "/usr/bin/xvfb-run"]);
        let wrapper = cli.settings().slicer.display_wrapper.unwrap();
        assert_eq!(wrapper.program, "/usr/bin/xvfb-run");
        assert!(wrapper.args.contains(&"--auto-servernum".to_string()));
    }

    #[test]
    fn test_fractional_support_angle() {
        let cli = parse(&["part.stl", "--support-threshold-angle", " 30.5 "]);
        assert_eq!(cli.settings().overrides.support_threshold_angle, "30.5");

        let cli = parse(&["part.stl"]);
        assert_eq!(cli.settings().overrides.support_threshold_angle, "30");
    }

    #[test]
    fn test_parse_errors_exit_with_failure() {
        let try_parse = |args: &[&str]| {
            Cli::try_parse_from(std::iter::once("slicequote").chain(args.iter().copied()))
        };

        let missing_input = try_parse(&[]).unwrap_err();
        assert_eq!(parse_exit_code(&missing_input), ExitCode::FAILURE);

        let bad_timeout = try_parse(&["part.stl", "--slice-timeout", "abc"]).unwrap_err();
        assert_eq!(parse_exit_code(&bad_timeout), ExitCode::FAILURE);

        let bad_angle = try_parse(&["part.stl", "--support-threshold-angle", "steep"]).unwrap_err();
        assert_eq!(parse_exit_code(&bad_angle), ExitCode::FAILURE);

        let help = try_parse(&["--help"]).unwrap_err();
        assert_eq!(parse_exit_code(&help), ExitCode::SUCCESS);
    }

    #[test]
    fn test_request_id_validation() {
        assert!(parse(&["part.stl", "../escape"]).request_id().is_err());
        assert_eq!(parse(&["part.stl"]).request_id().unwrap().as_str().len(), 12);
    }
}
