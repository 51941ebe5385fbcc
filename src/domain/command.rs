//! Operator commands accepted for a job

use serde::{Deserialize, Serialize};

/// Commands the importer service accepts for a given job id. Re-issuing a
/// command whose effect already holds (pause on a paused job) is a no-op;
/// a command against an incompatible state is a `CommandConflict`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobCommand {
    Start,
    Pause,
    Resume,
    Cancel,
    RetryFailed,
}

impl std::fmt::Display for JobCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::RetryFailed => "retry-failed",
        };
        f.write_str(s)
    }
}
