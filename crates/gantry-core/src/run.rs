//! The pipeline run aggregate and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::stage::{Classification, ExecutionResult};

/// Unique identifier for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Pipeline run lifecycle.
///
/// `Pending -> Running -> {Succeeded, FailedFast, CompletedWithWarnings}`.
/// Terminal states are immutable; notification hooks receive the run
/// only after it reaches one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    FailedFast,
    CompletedWithWarnings,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::FailedFast | RunState::CompletedWithWarnings
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::FailedFast => "failed_fast",
            RunState::CompletedWithWarnings => "completed_with_warnings",
        };
        f.write_str(s)
    }
}

/// Aggregate root for one pipeline execution.
///
/// Results are appended in stage order and always form a prefix of the
/// stage list actually attempted: no result for an unreached stage, no
/// two results for the same stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    pub results: Vec<ExecutionResult>,
    pub state: RunState,
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            id: RunId::new(),
            started_at: Utc::now(),
            results: Vec::new(),
            state: RunState::Pending,
        }
    }

    /// Transition from Pending to Running.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RunState::Pending {
            return Err(PipelineError::InvalidStateTransition {
                current: self.state.to_string(),
                requested: RunState::Running.to_string(),
            });
        }
        self.state = RunState::Running;
        Ok(())
    }

    /// Append the result for the next attempted stage.
    ///
    /// Rejects results recorded out of order or after the run reached a
    /// terminal state, which would break the prefix invariant.
    pub fn record(&mut self, result: ExecutionResult) -> Result<()> {
        if self.state != RunState::Running {
            return Err(PipelineError::InvalidStateTransition {
                current: self.state.to_string(),
                requested: "record".to_string(),
            });
        }
        if result.ordinal != self.results.len() {
            return Err(PipelineError::ResultOutOfOrder {
                expected: self.results.len(),
                got: result.ordinal,
            });
        }
        self.results.push(result);
        Ok(())
    }

    /// Transition to a terminal state. Idempotent finalization is a bug,
    /// not a convenience: a second call is rejected.
    pub fn finalize(&mut self, state: RunState) -> Result<()> {
        if !state.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                current: self.state.to_string(),
                requested: state.to_string(),
            });
        }
        if self.state != RunState::Running {
            return Err(PipelineError::InvalidStateTransition {
                current: self.state.to_string(),
                requested: state.to_string(),
            });
        }
        self.state = state;
        Ok(())
    }

    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    /// Number of stages that failed or timed out.
    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.classification.is_failure())
            .count()
    }

    /// Number of stages that were skipped.
    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.classification == Classification::Skipped)
            .count()
    }

    /// Summary for reporting and notification payloads.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            state: self.state,
            total: self.results.len(),
            succeeded: self.passed_count(),
            failed: self.failed_count(),
            skipped: self.skipped_count(),
            duration_ms: self.results.iter().map(|r| r.duration_ms).sum(),
        }
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Condensed view of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: RunState,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}
