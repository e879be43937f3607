//! Gantry Pipeline - release pipeline execution
//!
//! Provides the orchestration core:
//! - Executes local stages with timeouts and bounded output capture
//! - Gates the vulnerability scan on cache freshness
//! - Runs remote stages over SSH with failure classification
//! - Sequences stages under per-stage abort policies
//! - Merges log sources into one ordered artifact

pub mod aggregate;
pub mod engine;
pub mod gate;
pub mod notify;
pub mod remote;
pub mod runner;
pub mod transport;

// Re-export key types
pub use aggregate::{LogAggregator, LogArtifact};
pub use engine::PipelineEngine;
pub use gate::CacheGate;
pub use notify::{NoopNotifier, Notifier, WebhookNotifier};
pub use remote::{RemoteAttempt, RemoteExecutor, RemoteOutcome};
pub use runner::StageRunner;
pub use transport::{CommandTransport, RemoteOutput, SshTransport, TransportOutcome};
