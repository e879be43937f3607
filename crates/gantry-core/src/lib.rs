//! Gantry Core - domain model for the release pipeline orchestrator
//!
//! Provides the types shared by the pipeline engine and the CLI:
//! - Stage definitions with per-stage abort policies and timeouts
//! - Execution results with bounded output capture
//! - The `PipelineRun` aggregate and its state machine
//! - Cache freshness state for the vulnerability database gate
//! - Pipeline configuration loading and the built-in release catalog

pub mod cache;
pub mod config;
pub mod error;
pub mod run;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use cache::{CacheReadiness, CacheState};
pub use config::{
    CacheConfig, CachePolicy, CredentialRef, ExitPolicy, GantryConfig, LogOrigin, LogSource,
    RemoteTarget, ScannerConfig, Severity,
};
pub use error::{PipelineError, Result};
pub use run::{PipelineRun, RunId, RunState, RunSummary};
pub use stage::{AbortPolicy, CapturedOutput, Classification, ExecutionResult, Stage, StageKind};
