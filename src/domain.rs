//! Domain layer - entities, commands, events and collaborator contracts
//!
//! Holds the import job / unit data model and the narrow trait seams the
//! engine talks through (job store, record service, source storage).

pub mod command;
pub mod event;
pub mod job;
pub mod repositories;
pub mod services;
pub mod unit;

pub use command::JobCommand;
pub use event::{EventBus, ImportEvent};
pub use job::{ImportJob, JobConfig, JobState, OperationMode, SourceFormat, UnitCounts};
pub use unit::{FailureKind, ImportUnit, UnitFailure, UnitOutcome, UnitState};
