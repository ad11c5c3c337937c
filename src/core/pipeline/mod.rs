//! Runs the patch steps in order over one archive set and reports their progress.

pub mod env;
pub mod patch;
pub mod run;

pub use env::{ArchiveSet, RunEnv, TargetVariant};
pub use patch::{Pipeline, RunReport, Services, StartOutcome};
pub use run::{Diagnostics, PatchRun, PipelineEvent, StepCategory, StepKind, StepSnapshot, StepStatus};
