//! Local stage execution with timeout and bounded output capture.

use chrono::Utc;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::warn;

use gantry_core::{CapturedOutput, Classification, ExecutionResult, Stage};

/// Executes one stage's command on the orchestrator host.
pub struct StageRunner;

impl StageRunner {
    /// Execute `command` for `stage` and return exactly one result.
    ///
    /// Every outcome is represented in the result; this function never
    /// propagates command failure as an error. Credentials referenced by
    /// the stage are resolved at spawn time, injected into the child
    /// environment, and dropped with the child — they are never written
    /// into the result.
    pub async fn run(stage: &Stage, command: &[String]) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let (exe, args) = match command.split_first() {
            Some(split) => split,
            None => return ExecutionResult::failed(stage, "empty command"),
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(&stage.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(credential) = &stage.credential {
            match credential.resolve() {
                Some(secret) => {
                    cmd.env(credential.var_name(), secret);
                }
                None => {
                    return ExecutionResult::failed(
                        stage,
                        format!("credential '{}' not set in environment", credential.var_name()),
                    );
                }
            }
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failed(stage, format!("failed to spawn '{}': {}", exe, e))
            }
        };

        let wait = child.wait_with_output();
        let output = if stage.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(stage.timeout_secs), wait).await {
                Ok(result) => result,
                Err(_) => {
                    // Dropping the wait future kills the child (kill_on_drop).
                    warn!(stage = %stage.name, timeout_secs = stage.timeout_secs, "stage timed out");
                    return ExecutionResult {
                        stage_name: stage.name.clone(),
                        ordinal: stage.ordinal,
                        classification: Classification::TimedOut,
                        exit_code: None,
                        stdout: CapturedOutput::empty(),
                        stderr: CapturedOutput::empty(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        started_at,
                        note: Some(format!("timed out after {}s", stage.timeout_secs)),
                    };
                }
            }
        } else {
            wait.await
        };

        let output = match output {
            Ok(out) => out,
            Err(e) => return ExecutionResult::failed(stage, format!("wait failed: {}", e)),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let classification = if output.status.success() {
            Classification::Success
        } else {
            Classification::Failure
        };

        ExecutionResult {
            stage_name: stage.name.clone(),
            ordinal: stage.ordinal,
            classification,
            exit_code: Some(exit_code),
            stdout: CapturedOutput::from_bytes(&output.stdout),
            stderr: CapturedOutput::from_bytes(&output.stderr),
            duration_ms: start.elapsed().as_millis() as u64,
            started_at,
            note: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::CredentialRef;

    fn local_stage(name: &str, command: &[&str]) -> Stage {
        Stage::local(
            name,
            0,
            command.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_successful_command() {
        let stage = local_stage("echo_test", &["echo", "hello"]);
        let result = StageRunner::run(&stage, command_of(&stage)).await;
        assert_eq!(result.classification, Classification::Success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.text.contains("hello"));
        assert!(!result.stdout.truncated);
    }

    #[tokio::test]
    async fn test_failing_command() {
        let stage = local_stage("false_test", &["false"]);
        let result = StageRunner::run(&stage, command_of(&stage)).await;
        assert_eq!(result.classification, Classification::Failure);
        assert_ne!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_error_is_failure_not_panic() {
        let stage = local_stage("missing", &["/nonexistent-binary-gantry-test"]);
        let result = StageRunner::run(&stage, command_of(&stage)).await;
        assert_eq!(result.classification, Classification::Failure);
        assert!(result.note.as_deref().unwrap_or("").contains("spawn"));
    }

    #[tokio::test]
    async fn test_timeout_classified_timed_out() {
        let stage = local_stage("sleepy", &["sleep", "5"]).with_timeout(1);
        let result = StageRunner::run(&stage, command_of(&stage)).await;
        assert_eq!(result.classification, Classification::TimedOut);
        assert!(result.exit_code.is_none());
        assert!(result.classification.is_failure());
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_spawn() {
        let mut stage = local_stage("push", &["echo", "push"]);
        stage.credential = Some(CredentialRef("GANTRY_TEST_ABSENT_VAR".to_string()));
        let result = StageRunner::run(&stage, command_of(&stage)).await;
        assert_eq!(result.classification, Classification::Failure);
        let note = result.note.expect("note");
        assert!(note.contains("GANTRY_TEST_ABSENT_VAR"));
        // The note names the variable, never a secret value.
        assert!(!note.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_credential_injected_into_child_env() {
        std::env::set_var("GANTRY_TEST_TOKEN", "tok-123");
        let mut stage = local_stage("push", &["sh", "-c", "printf %s \"$GANTRY_TEST_TOKEN\""]);
        stage.credential = Some(CredentialRef("GANTRY_TEST_TOKEN".to_string()));
        let result = StageRunner::run(&stage, command_of(&stage)).await;
        assert_eq!(result.classification, Classification::Success);
        assert_eq!(result.stdout.text, "tok-123");
        std::env::remove_var("GANTRY_TEST_TOKEN");
    }

    fn command_of(stage: &Stage) -> &[String] {
        match &stage.kind {
            gantry_core::StageKind::Local { command } => command,
            _ => unreachable!("test stages are local"),
        }
    }
}
