//! End-to-end job: sweep, prepare, slice, parse, price, report.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, info_span, warn, Instrument};

use crate::archive;
use crate::cost::CostModel;
use crate::error::{Result, SliceQuoteError};
use crate::invocation::{InputKind, SliceInvocation, SliceTargets};
use crate::profile::ConfigComposer;
use crate::report::{JobReport, ResultReporter};
use crate::settings::Settings;
use crate::supervisor::SlicerSupervisor;
use crate::workspace::{describe, RequestId, WorkDir, WorkspaceManager};

/// One request to price a single input file.
#[derive(Debug, Clone)]
pub struct Job {
    request_id: RequestId,
    input: PathBuf,
    settings: Settings,
    cost_model: CostModel,
}

impl Job {
    /// Create a job; a request id is generated when none is supplied.
    pub fn new(
        settings: Settings,
        input: impl Into<PathBuf>,
        request_id: Option<RequestId>,
    ) -> Self {
        Self {
            request_id: request_id.unwrap_or_else(RequestId::generate),
            input: input.into(),
            settings,
            cost_model: CostModel::default(),
        }
    }

    /// Replace the default cost model.
    pub fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Request identifier.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Run the job and write the result lines to `out`.
    ///
    /// Stale directories are swept before this job's directory exists. Once
    /// it exists, it is removed on every exit path.
    pub async fn run<W: Write>(self, out: &mut W) -> Result<JobReport> {
        let span = info_span!("job", request_id = %self.request_id);
        let started = Instant::now();
        let workspace = WorkspaceManager::new(self.settings.work_base());

        let prepared = span.in_scope(|| {
            match workspace.sweep_stale(self.settings.cleanup_age) {
                Ok(report) if !report.failures.is_empty() => {
                    warn!(failures = report.failures.len(), "stale sweep had failures")
                }
                Ok(_) => {}
                Err(diag) => warn!(%diag, "Cleanup error"),
            }
            workspace.prepare(&self.request_id)
        });
        let reporter = ResultReporter::new(workspace.guard(prepared?));

        let outcome = self
            .pipeline(reporter.work_dir())
            .instrument(span.clone())
            .await;

        span.in_scope(|| {
            let result = reporter.finish(outcome, out);
            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                "=== END slicequote ==="
            );
            result
        })
    }

    async fn pipeline(&self, work: &WorkDir) -> Result<JobReport> {
        let settings = &self.settings;
        let profiles = settings.profile_paths();
        info!("=== START slicequote ===");
        info!(version = env!("CARGO_PKG_VERSION"), work_dir = %work.root.display());

        let input = self.input.as_path();
        if !input.is_file() {
            return Err(SliceQuoteError::InputNotFound(input.to_path_buf()));
        }
        let kind = InputKind::of(input);
        let presliced = kind == InputKind::Archive && archive::is_presliced(input);
        let needs_slicing = !presliced;

        info!("Check inputs:");
        info!("  project_file: {} -> {}", input.display(), describe(input));
        info!("  input_type: {}", input_label(kind, presliced));
        for (label, path) in [
            ("printer_machine_config", &profiles.machine),
            ("print_quality_config", &profiles.process),
            ("filament_config", &profiles.filament),
            ("output_directory", &work.output_dir),
        ] {
            info!("  {label}: {} -> {}", path.display(), describe(path));
        }

        let archive_path = if presliced {
            input.to_path_buf()
        } else {
            work.file(&format!("{}_output.3mf", file_stem(input)))
        };

        let effective = ConfigComposer::new(settings.overrides.clone()).compose(
            &profiles.process,
            needs_slicing,
            &work.root,
        );

        if needs_slicing {
            let targets = SliceTargets {
                archive: archive_path.clone(),
                slice_data_dir: work.output_dir.clone(),
            };
            let invocation = SliceInvocation::build(
                &settings.slicer,
                &profiles,
                &effective.path,
                &targets,
                input,
            );
            let mut supervisor = SlicerSupervisor::new(&settings.slicer, work);
            supervisor.run(&invocation, &targets).await?.into_result()?;
        } else {
            info!("=== Skipping slicing (input is pre-sliced 3MF) ===");
        }

        let metadata = archive::parse(&archive_path)?;
        let hours = metadata.printing_hours();
        let grams = self.cost_model.filament_grams(&metadata.usage);
        let cost = self.cost_model.estimate(hours, grams, &settings.pricing);
        info!(
            hours,
            depreciation_per_hour = self.cost_model.depreciation_rate_per_hour(),
            electricity_per_hour = self.cost_model.electricity_rate_per_hour(),
            filament_grams = grams,
            filament_cost = cost.filament_cost,
            "computed cost"
        );

        Ok(JobReport::new(
            self.request_id.as_str(),
            &file_name(input),
            hours,
            grams,
            &cost,
            settings.profiles.clone(),
        ))
    }
}

fn input_label(kind: InputKind, presliced: bool) -> &'static str {
    match (kind, presliced) {
        (InputKind::Archive, true) => "3MF (pre-sliced)",
        (InputKind::Archive, false) => "3MF (needs slicing)",
        (InputKind::Geometry, _) => "STL (needs slicing)",
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".into())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
