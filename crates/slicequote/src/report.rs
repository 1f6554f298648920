//! Job result output and guaranteed teardown.
//!
//! Callers parse the `RESULT_JSON:` line on stdout; the `Total Cost:` line
//! is kept for older consumers.

use std::io::Write;

use serde::Serialize;
use tracing::{error, info};

use crate::cost::{round_to, CostBreakdown};
use crate::error::Result;
use crate::settings::ProfileSelection;
use crate::workspace::{WorkDir, WorkDirGuard};

/// Prefix of the machine-readable result line.
pub const RESULT_TAG: &str = "RESULT_JSON:";

/// Final result of a job as emitted on stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    /// Request identifier.
    pub request_id: String,
    /// Input file name without directories.
    pub file: String,
    /// Total cost, 4 decimals.
    pub total_cost: f64,
    /// Estimated printing hours, 3 decimals.
    pub printing_hours: f64,
    /// Filament mass (g), 2 decimals.
    pub filament_grams: f64,
    /// Filament cost, 2 decimals.
    pub filament_cost: f64,
    /// Depreciation cost, 4 decimals.
    pub depreciation_cost: f64,
    /// Electricity cost, 4 decimals.
    pub electricity_cost: f64,
    /// Profiles used.
    pub config: ProfileSelection,
}

impl JobReport {
    /// Assemble a report, rounding each figure for output.
    pub fn new(
        request_id: &str,
        file: &str,
        printing_hours: f64,
        filament_grams: f64,
        cost: &CostBreakdown,
        config: ProfileSelection,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            file: file.to_string(),
            total_cost: round_to(cost.total_cost, 4),
            printing_hours: round_to(printing_hours, 3),
            filament_grams: round_to(filament_grams, 2),
            filament_cost: round_to(cost.filament_cost, 2),
            depreciation_cost: round_to(cost.depreciation_cost, 4),
            electricity_cost: round_to(cost.electricity_cost, 4),
            config,
        }
    }

    /// `RESULT_JSON:{...}` on a single line.
    pub fn result_line(&self) -> serde_json::Result<String> {
        Ok(format!("{RESULT_TAG}{}", serde_json::to_string(self)?))
    }

    /// `Total Cost: <total>` with 4 decimals.
    pub fn legacy_line(&self) -> String {
        format!("Total Cost: {:.4}", self.total_cost)
    }

    /// Write both result lines and flush.
    pub fn emit<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "{}", self.result_line()?)?;
        writeln!(out, "{}", self.legacy_line())?;
        out.flush()
    }
}

/// Emits the job result and removes the work directory on every path.
#[derive(Debug)]
pub struct ResultReporter {
    guard: WorkDirGuard,
}

impl ResultReporter {
    /// Take ownership of a job's work directory.
    pub fn new(guard: WorkDirGuard) -> Self {
        Self { guard }
    }

    /// The job's work directory.
    pub fn work_dir(&self) -> &WorkDir {
        self.guard.dir()
    }

    /// Emit the outcome and tear the work directory down.
    ///
    /// Teardown runs whether the job succeeded, failed, or emitting failed,
    /// and never replaces the original error.
    pub fn finish<W: Write>(self, outcome: Result<JobReport>, out: &mut W) -> Result<JobReport> {
        let outcome = outcome.and_then(|report| {
            report.emit(out)?;
            info!("Total Cost: {:.4}", report.total_cost);
            Ok(report)
        });
        if let Err(e) = &outcome {
            error!(error = %e, "job failed");
        }
        self.guard.teardown();
        outcome
    }
}
