//! Stage definitions and execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::CredentialRef;

/// Maximum bytes of stdout/stderr retained per stream in a result.
/// Anything beyond this is dropped and the capture is flagged truncated.
pub const OUTPUT_CAP_BYTES: usize = 64 * 1024;

/// What a stage failure does to the rest of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Failure stops the pipeline; remaining stages are never attempted.
    AbortOnFailure,

    /// Failure is recorded as a warning and the pipeline proceeds.
    ContinueOnFailure,

    /// Outcome is recorded but never influences the final run state.
    BestEffort,
}

impl Default for AbortPolicy {
    fn default() -> Self {
        AbortPolicy::AbortOnFailure
    }
}

/// How a stage's work is executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    /// Command executed on the orchestrator host.
    Local { command: Vec<String> },

    /// Command executed on the configured remote target over SSH.
    Remote { command: String },

    /// Scanner invocation gated on cache readiness. `degraded_args` are
    /// appended when the cache gate reports degraded mode (skip-update).
    Scan {
        command: Vec<String>,
        #[serde(default)]
        degraded_args: Vec<String>,
    },

    /// Terminal stage that merges the configured log sources into one
    /// artifact instead of running a command.
    Collect,
}

/// One named unit of pipeline work. Immutable once the pipeline is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Human-readable stage name, unique within a pipeline.
    pub name: String,

    /// Zero-based position in the stage sequence.
    pub ordinal: usize,

    #[serde(flatten)]
    pub kind: StageKind,

    /// Timeout in seconds; 0 means no timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub abort_policy: AbortPolicy,

    /// Extra environment for the stage command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Credential injected just-in-time at spawn; never stored in results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,

    /// Retry the command once on failure (registry push only; the
    /// command must be idempotent).
    #[serde(default)]
    pub retry_once: bool,

    /// Whether this stage is enabled. Disabled stages record a skipped
    /// result so the run history stays a prefix of the stage list.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_enabled() -> bool {
    true
}

impl Stage {
    /// Create a local command stage.
    pub fn local(name: &str, ordinal: usize, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            kind: StageKind::Local { command },
            timeout_secs: default_timeout_secs(),
            abort_policy: AbortPolicy::default(),
            env: HashMap::new(),
            credential: None,
            retry_once: false,
            enabled: true,
        }
    }

    /// Create a remote command stage.
    pub fn remote(name: &str, ordinal: usize, command: &str) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            kind: StageKind::Remote {
                command: command.to_string(),
            },
            timeout_secs: default_timeout_secs(),
            abort_policy: AbortPolicy::default(),
            env: HashMap::new(),
            credential: None,
            retry_once: false,
            enabled: true,
        }
    }

    /// Set the abort policy.
    pub fn with_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    /// Set the timeout in seconds.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Terminal classification of one stage execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    Failure,
    Skipped,
    TimedOut,
}

impl Classification {
    /// Timed-out is treated identically to failure for abort policy.
    pub fn is_failure(&self) -> bool {
        matches!(self, Classification::Failure | Classification::TimedOut)
    }
}

/// Captured stream output, bounded to `OUTPUT_CAP_BYTES`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            truncated: false,
        }
    }

    /// Capture raw bytes, keeping at most `OUTPUT_CAP_BYTES` and marking
    /// truncation explicitly rather than dropping data silently.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() <= OUTPUT_CAP_BYTES {
            Self {
                text: String::from_utf8_lossy(bytes).to_string(),
                truncated: false,
            }
        } else {
            Self {
                text: String::from_utf8_lossy(&bytes[..OUTPUT_CAP_BYTES]).to_string(),
                truncated: true,
            }
        }
    }
}

/// Outcome of one stage execution. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Name of the stage this result belongs to.
    pub stage_name: String,

    /// Ordinal of the stage in the pipeline sequence.
    pub ordinal: usize,

    pub classification: Classification,

    /// Exit code of the command, if one ran to completion.
    pub exit_code: Option<i32>,

    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    pub started_at: DateTime<Utc>,

    /// Free-form annotation: degraded mode, retry, skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ExecutionResult {
    /// Result for a stage that was skipped without running a command.
    pub fn skipped(stage: &Stage, note: impl Into<String>) -> Self {
        Self {
            stage_name: stage.name.clone(),
            ordinal: stage.ordinal,
            classification: Classification::Skipped,
            exit_code: None,
            stdout: CapturedOutput::empty(),
            stderr: CapturedOutput::empty(),
            duration_ms: 0,
            started_at: Utc::now(),
            note: Some(note.into()),
        }
    }

    /// Result for a stage that failed before a command could complete
    /// (spawn error, rejected credential, unreachable host).
    pub fn failed(stage: &Stage, note: impl Into<String>) -> Self {
        Self {
            stage_name: stage.name.clone(),
            ordinal: stage.ordinal,
            classification: Classification::Failure,
            exit_code: None,
            stdout: CapturedOutput::empty(),
            stderr: CapturedOutput::empty(),
            duration_ms: 0,
            started_at: Utc::now(),
            note: Some(note.into()),
        }
    }

    /// Whether this stage passed.
    pub fn passed(&self) -> bool {
        self.classification == Classification::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_output_within_cap() {
        let out = CapturedOutput::from_bytes(b"hello");
        assert_eq!(out.text, "hello");
        assert!(!out.truncated);
    }

    #[test]
    fn test_captured_output_truncated() {
        let big = vec![b'x'; OUTPUT_CAP_BYTES + 1];
        let out = CapturedOutput::from_bytes(&big);
        assert_eq!(out.text.len(), OUTPUT_CAP_BYTES);
        assert!(out.truncated);
    }

    #[test]
    fn test_timed_out_counts_as_failure() {
        assert!(Classification::TimedOut.is_failure());
        assert!(Classification::Failure.is_failure());
        assert!(!Classification::Skipped.is_failure());
        assert!(!Classification::Success.is_failure());
    }

    #[test]
    fn test_stage_builders() {
        let stage = Stage::local("build", 1, vec!["make".to_string()])
            .with_policy(AbortPolicy::ContinueOnFailure)
            .with_timeout(30);
        assert_eq!(stage.name, "build");
        assert_eq!(stage.timeout_secs, 30);
        assert_eq!(stage.abort_policy, AbortPolicy::ContinueOnFailure);
        assert!(stage.enabled);

        let stage = Stage::remote("deploy", 2, "kubectl apply -f app.yaml").disabled();
        assert!(!stage.enabled);
    }

    #[test]
    fn test_skipped_result_has_no_exit_code() {
        let stage = Stage::local("scan", 0, vec!["scanner".to_string()]);
        let result = ExecutionResult::skipped(&stage, "cache unavailable");
        assert_eq!(result.classification, Classification::Skipped);
        assert!(result.exit_code.is_none());
        assert_eq!(result.note.as_deref(), Some("cache unavailable"));
    }

    #[test]
    fn test_stage_kind_serde_roundtrip() {
        let stage = Stage::local("build", 0, vec!["cargo".to_string(), "build".to_string()]);
        let json = serde_json::to_string(&stage).expect("serialize");
        let back: Stage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, stage.kind);
    }
}
