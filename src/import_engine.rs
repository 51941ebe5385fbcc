//! Import engine - the orchestration core
//!
//! Parser, validator, processor, dispatcher, progress aggregation and the
//! job state machine. Everything here is collaborator-agnostic: durable
//! state goes through `domain::repositories::JobStore`, external mutations
//! through `domain::services::RecordService`.

pub mod dispatcher;
pub mod parser;
pub mod processor;
pub mod progress;
pub mod state_machine;
pub mod validator;

pub use dispatcher::{DispatchConfig, DispatchOutcome, Dispatcher, RunSignal};
pub use parser::{ParseError, RawUnit, SourcePosition, UnitParser};
pub use processor::{AttemptContext, AttemptOutcome, UnitProcessor};
pub use progress::{JobProgress, ProgressRegistry, ProgressSnapshot};
pub use state_machine::{CommandConflict, JobStateMachine};
pub use validator::{UnitValidator, ValidationError};
