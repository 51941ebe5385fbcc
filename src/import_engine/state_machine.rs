//! Job state machine - pure transitions
//!
//! Job state is a function of the per-unit state distribution plus explicit
//! operator commands. Commands whose effect already holds are no-ops
//! (pause on paused); commands against an incompatible state are
//! `CommandConflict` errors that leave the job unchanged.

use thiserror::Error;

use crate::domain::command::JobCommand;
use crate::domain::job::{JobState, UnitCounts};

/// An operator command issued against an incompatible job state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("command '{command}' not allowed while job is {state}")]
pub struct CommandConflict {
    pub command: JobCommand,
    pub state: JobState,
}

/// Pure transition functions; holds no state of its own.
pub struct JobStateMachine;

impl JobStateMachine {
    /// Apply an operator command. Returns the resulting state; re-issuing a
    /// command whose effect already holds returns the current state.
    pub fn apply(state: JobState, command: JobCommand) -> Result<JobState, CommandConflict> {
        use JobCommand::*;
        use JobState::*;

        let next = match (state, command) {
            (Draft, Start) => Validating,
            (Ready, Start) => Running,

            (Running, Pause) => Paused,
            (Paused, Pause) => Paused,

            (Paused, Resume) => Running,
            (Running, Resume) => Running,

            (Cancelled, Cancel) => Cancelled,
            (s, Cancel) if !s.is_terminal() => Cancelled,

            (CompletedWithErrors, RetryFailed) | (Failed, RetryFailed) => Running,

            (state, command) => return Err(CommandConflict { command, state }),
        };
        Ok(next)
    }

    pub fn allows(state: JobState, command: JobCommand) -> bool {
        Self::apply(state, command).is_ok()
    }

    /// Outcome of the parsing/validation phase.
    pub fn validation_outcome(invalid_units: u64, allow_partial: bool) -> JobState {
        if invalid_units == 0 || allow_partial {
            JobState::Ready
        } else {
            JobState::Failed
        }
    }

    /// Derive the final state once every unit is terminal. A fail-fast
    /// trigger ends the job `failed` regardless of the distribution.
    pub fn finalize(counts: UnitCounts, fail_fast_triggered: bool) -> JobState {
        debug_assert!(counts.all_terminal());
        if fail_fast_triggered {
            JobState::Failed
        } else if counts.failed > 0 {
            JobState::CompletedWithErrors
        } else {
            JobState::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // start
    #[case(JobState::Draft, JobCommand::Start, Ok(JobState::Validating))]
    #[case(JobState::Ready, JobCommand::Start, Ok(JobState::Running))]
    #[case(JobState::Running, JobCommand::Start, Err(()))]
    #[case(JobState::Completed, JobCommand::Start, Err(()))]
    // pause
    #[case(JobState::Running, JobCommand::Pause, Ok(JobState::Paused))]
    #[case(JobState::Paused, JobCommand::Pause, Ok(JobState::Paused))]
    #[case(JobState::Draft, JobCommand::Pause, Err(()))]
    #[case(JobState::Completed, JobCommand::Pause, Err(()))]
    // resume
    #[case(JobState::Paused, JobCommand::Resume, Ok(JobState::Running))]
    #[case(JobState::Running, JobCommand::Resume, Ok(JobState::Running))]
    #[case(JobState::Completed, JobCommand::Resume, Err(()))]
    #[case(JobState::Draft, JobCommand::Resume, Err(()))]
    // cancel
    #[case(JobState::Draft, JobCommand::Cancel, Ok(JobState::Cancelled))]
    #[case(JobState::Running, JobCommand::Cancel, Ok(JobState::Cancelled))]
    #[case(JobState::Paused, JobCommand::Cancel, Ok(JobState::Cancelled))]
    #[case(JobState::Cancelled, JobCommand::Cancel, Ok(JobState::Cancelled))]
    #[case(JobState::Completed, JobCommand::Cancel, Err(()))]
    #[case(JobState::Failed, JobCommand::Cancel, Err(()))]
    // retry-failed
    #[case(JobState::CompletedWithErrors, JobCommand::RetryFailed, Ok(JobState::Running))]
    #[case(JobState::Failed, JobCommand::RetryFailed, Ok(JobState::Running))]
    #[case(JobState::Completed, JobCommand::RetryFailed, Err(()))]
    #[case(JobState::Cancelled, JobCommand::RetryFailed, Err(()))]
    #[case(JobState::Running, JobCommand::RetryFailed, Err(()))]
    fn command_transitions(
        #[case] state: JobState,
        #[case] command: JobCommand,
        #[case] expected: Result<JobState, ()>,
    ) {
        let result = JobStateMachine::apply(state, command);
        match expected {
            Ok(next) => assert_eq!(result.unwrap(), next),
            Err(()) => {
                let conflict = result.unwrap_err();
                assert_eq!(conflict.state, state);
                assert_eq!(conflict.command, command);
            }
        }
    }

    #[test]
    fn validation_outcome_rules() {
        assert_eq!(
            JobStateMachine::validation_outcome(0, false),
            JobState::Ready
        );
        assert_eq!(
            JobStateMachine::validation_outcome(3, true),
            JobState::Ready
        );
        assert_eq!(
            JobStateMachine::validation_outcome(3, false),
            JobState::Failed
        );
    }

    #[test]
    fn finalize_from_counts() {
        let clean = UnitCounts {
            total: 5,
            succeeded: 4,
            failed: 0,
            skipped: 1,
        };
        assert_eq!(JobStateMachine::finalize(clean, false), JobState::Completed);

        let with_failures = UnitCounts {
            total: 5,
            succeeded: 3,
            failed: 2,
            skipped: 0,
        };
        assert_eq!(
            JobStateMachine::finalize(with_failures, false),
            JobState::CompletedWithErrors
        );
        assert_eq!(
            JobStateMachine::finalize(with_failures, true),
            JobState::Failed
        );
    }
}
