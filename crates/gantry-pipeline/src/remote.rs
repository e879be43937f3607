//! Remote stage execution with failure classification and retry policy.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use gantry_core::{CapturedOutput, Classification, ExecutionResult, RemoteTarget, Stage};

use crate::transport::{CommandTransport, RemoteOutput, TransportOutcome};

/// Final outcome of a remote invocation, after the retry policy ran.
#[derive(Debug)]
pub struct RemoteAttempt {
    pub outcome: RemoteOutcome,
    pub retried: bool,
}

#[derive(Debug)]
pub enum RemoteOutcome {
    /// Session established, remote command exited (possibly non-zero).
    Completed(RemoteOutput),

    /// Credential rejected. Never retried.
    AuthFailure(String),

    /// Connection could not be established, even after the retry.
    NetworkFailure(String),

    /// The session outlived the timeout. Never retried: a timeout gives
    /// no evidence the remote side effect did not happen.
    TimedOut,
}

/// Runs a command on the remote target, surfacing remote exit status and
/// output as if local.
///
/// Retry policy: a network failure is retried exactly once after a
/// backoff; an authentication failure is fatal and never retried; a
/// remote command that exited non-zero is surfaced verbatim and never
/// retried — its side effects may not be idempotent.
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn CommandTransport>,
    retry_backoff: Duration,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            transport,
            retry_backoff: Duration::from_secs(2),
        }
    }

    /// Override the network-retry backoff (tests use a short one).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run `command` on `target` with the timeout applied per attempt.
    ///
    /// This is the one place the retry policy lives; stage execution and
    /// log collection both go through it.
    pub async fn run(
        &self,
        target: &RemoteTarget,
        command: &str,
        timeout: Option<Duration>,
    ) -> RemoteAttempt {
        let mut retried = false;

        loop {
            let attempt = match timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, self.transport.exec(target, command)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            return RemoteAttempt {
                                outcome: RemoteOutcome::TimedOut,
                                retried,
                            }
                        }
                    }
                }
                None => self.transport.exec(target, command).await,
            };

            match attempt {
                TransportOutcome::Completed(output) => {
                    return RemoteAttempt {
                        outcome: RemoteOutcome::Completed(output),
                        retried,
                    }
                }
                TransportOutcome::AuthFailure(detail) => {
                    return RemoteAttempt {
                        outcome: RemoteOutcome::AuthFailure(detail),
                        retried,
                    }
                }
                TransportOutcome::NetworkFailure(detail) => {
                    if retried {
                        return RemoteAttempt {
                            outcome: RemoteOutcome::NetworkFailure(detail),
                            retried,
                        };
                    }
                    warn!(host = %target.host, detail = %detail, "connection failed, retrying once");
                    tokio::time::sleep(self.retry_backoff).await;
                    retried = true;
                }
            }
        }
    }

    /// Execute `command` on `target` for `stage`, yielding exactly one result.
    pub async fn exec(
        &self,
        target: &RemoteTarget,
        stage: &Stage,
        command: &str,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let timeout = (stage.timeout_secs > 0).then(|| Duration::from_secs(stage.timeout_secs));
        let attempt = self.run(target, command, timeout).await;

        let (classification, exit_code, stdout, stderr, note) = match attempt.outcome {
            RemoteOutcome::Completed(output) => {
                let classification = if output.success() {
                    Classification::Success
                } else {
                    Classification::Failure
                };
                (
                    classification,
                    Some(output.exit_code),
                    CapturedOutput::from_bytes(&output.stdout),
                    CapturedOutput::from_bytes(&output.stderr),
                    attempt
                        .retried
                        .then(|| "succeeded after network retry".to_string()),
                )
            }
            RemoteOutcome::AuthFailure(detail) => (
                Classification::Failure,
                None,
                CapturedOutput::empty(),
                CapturedOutput::empty(),
                Some(format!(
                    "authentication rejected by {}: {}",
                    target.host, detail
                )),
            ),
            RemoteOutcome::NetworkFailure(detail) => (
                Classification::Failure,
                None,
                CapturedOutput::empty(),
                CapturedOutput::empty(),
                Some(format!(
                    "network failure reaching {} after retry: {}",
                    target.host, detail
                )),
            ),
            RemoteOutcome::TimedOut => (
                Classification::TimedOut,
                None,
                CapturedOutput::empty(),
                CapturedOutput::empty(),
                Some(format!(
                    "remote command timed out after {}s",
                    stage.timeout_secs
                )),
            ),
        };

        ExecutionResult {
            stage_name: stage.name.clone(),
            ordinal: stage.ordinal,
            classification,
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            started_at,
            note,
        }
    }
}
