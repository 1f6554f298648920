#![warn(missing_docs)]

//! Print cost quotes from Bambu Studio slicing.
//!
//! This crate provides:
//! - Per-request work directories with a stale-directory sweep
//! - Process profile composition with support and wall/infill overrides
//! - Supervised headless slicer runs with timeout and progress logging
//! - Usage and duration extraction from sliced 3MF archives
//! - Depreciation, electricity and filament cost estimation
//!
//! # Example
//!
//! ```ignore
//! use slicequote::{Job, RequestId, Settings};
//!
//! let job = Job::new(Settings::default(), "/uploads/part.stl", Some(RequestId::parse("r42")?));
//! let report = job.run(&mut std::io::stdout()).await?;
//! println!("{} costs {:.2}", report.file, report.total_cost);
//! ```

pub mod archive;
pub mod cost;
pub mod error;
pub mod invocation;
pub mod job;
pub mod probe;
pub mod profile;
pub mod report;
pub mod settings;
pub mod supervisor;
pub mod workspace;

pub use archive::{FilamentUsage, ParsedMetadata, PrintDuration};
pub use cost::{CostBreakdown, CostModel, DepreciationItem, FilamentSpec, DEPRECIATION_TABLE};
pub use error::{Diagnostic, Result, SliceQuoteError};
pub use invocation::{InputKind, SliceInvocation, SliceTargets};
pub use job::Job;
pub use profile::{ConfigComposer, EffectiveProfile};
pub use report::{JobReport, ResultReporter, RESULT_TAG};
pub use settings::{
    DisplayWrapper, Pricing, ProfileOverrides, ProfileSelection, ProfileSource, Settings,
    SlicerSettings,
};
pub use supervisor::{SliceOutcome, SliceResult, SlicerSupervisor, SupervisorState};
pub use workspace::{RequestId, WorkDir, WorkDirGuard, WorkspaceManager};
