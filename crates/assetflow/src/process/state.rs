//! Step and process status lattice.
//!
//! A step moves `Pending -> InProgress -> {Completed, Failed}`. The only
//! way back is an explicit retry (`Failed -> Pending`). A process status is
//! a projection over its steps, except `Stopped`, which is written by an
//! external cancellation and never derived.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    /// Whether the lattice permits moving from `self` to `next`.
    pub const fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Failed)
                | (StepStatus::Failed, StepStatus::Pending)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" => Ok(StepStatus::InProgress),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(DatabaseError::UnknownValue {
                kind: "step status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Stopped,
}

impl ProcessStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::InProgress => "in_progress",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Stopped => "stopped",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Stopped
        )
    }

    /// Statuses a resumed process may be in.
    pub const NON_TERMINAL: [ProcessStatus; 2] = [ProcessStatus::Pending, ProcessStatus::InProgress];
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessStatus::Pending),
            "in_progress" => Ok(ProcessStatus::InProgress),
            "completed" => Ok(ProcessStatus::Completed),
            "failed" => Ok(ProcessStatus::Failed),
            "stopped" => Ok(ProcessStatus::Stopped),
            other => Err(DatabaseError::UnknownValue {
                kind: "process status",
                value: other.to_string(),
            }),
        }
    }
}

/// How a failed step affects the aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// A single failed step fails the process and stops further steps.
    #[default]
    FailFast,
    /// Failed steps are tolerated; the process completes once every step is
    /// terminal and at least one step completed.
    AllowPartial,
}

impl CompletionPolicy {
    pub const fn from_allow_partial(allow_partial: bool) -> Self {
        if allow_partial {
            CompletionPolicy::AllowPartial
        } else {
            CompletionPolicy::FailFast
        }
    }
}

/// Derives the aggregate status from step statuses.
///
/// A process without steps has nothing left to do and is `Completed`.
pub fn derive_status<I>(steps: I, policy: CompletionPolicy) -> ProcessStatus
where
    I: IntoIterator<Item = StepStatus>,
{
    let mut total = 0usize;
    let mut pending = 0usize;
    let mut completed = 0usize;
    let mut failed = 0usize;

    for status in steps {
        total += 1;
        match status {
            StepStatus::Pending => pending += 1,
            StepStatus::InProgress => {}
            StepStatus::Completed => completed += 1,
            StepStatus::Failed => failed += 1,
        }
    }

    if failed > 0 && policy == CompletionPolicy::FailFast {
        return ProcessStatus::Failed;
    }
    if completed + failed == total {
        return if completed == 0 && failed > 0 {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Completed
        };
    }
    if pending == total {
        return ProcessStatus::Pending;
    }
    ProcessStatus::InProgress
}

/// Aggregate progress of a process, recomputed from its steps on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessProgress {
    pub process_id: i64,
    pub status: ProcessStatus,
    pub completed_step_count: u64,
    pub failed_step_count: u64,
    pub total_step_count: u64,
}

impl ProcessProgress {
    pub fn from_steps<I>(process_id: i64, stored: ProcessStatus, steps: I, policy: CompletionPolicy) -> Self
    where
        I: IntoIterator<Item = StepStatus>,
    {
        let statuses: Vec<StepStatus> = steps.into_iter().collect();
        let count = |s: StepStatus| statuses.iter().filter(|&&x| x == s).count() as u64;
        let status = if stored == ProcessStatus::Stopped {
            ProcessStatus::Stopped
        } else {
            derive_status(statuses.iter().copied(), policy)
        };

        Self {
            process_id,
            status,
            completed_step_count: count(StepStatus::Completed),
            failed_step_count: count(StepStatus::Failed),
            total_step_count: statuses.len() as u64,
        }
    }
}
