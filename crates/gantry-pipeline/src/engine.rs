//! Pipeline orchestration and run state machine.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use gantry_core::{
    AbortPolicy, CachePolicy, CacheReadiness, CacheState, CapturedOutput, Classification,
    ExecutionResult, ExitPolicy, GantryConfig, PipelineRun, Result, RunState, Stage, StageKind,
};

use crate::aggregate::LogAggregator;
use crate::gate::CacheGate;
use crate::notify::Notifier;
use crate::remote::RemoteExecutor;
use crate::runner::StageRunner;
use crate::transport::CommandTransport;

/// Drives the stage sequence for one run.
///
/// `Pending -> Running -> {Succeeded, FailedFast, CompletedWithWarnings}`.
/// Stages execute strictly in order; a stage starts only after the
/// previous one reached a terminal result. The terminal notification
/// fires exactly once, after the run is finalized.
pub struct PipelineEngine {
    transport: Arc<dyn CommandTransport>,
    notifier: Arc<dyn Notifier>,
    retry_backoff: Duration,
}

impl PipelineEngine {
    pub fn new(transport: Arc<dyn CommandTransport>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            transport,
            notifier,
            retry_backoff: Duration::from_secs(2),
        }
    }

    /// Override the network-retry backoff (tests use a short one).
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run the pipeline to completion without an external abort signal.
    pub async fn run(&self, config: &GantryConfig) -> Result<PipelineRun> {
        let (_tx, rx) = watch::channel(false);
        self.run_with_abort(config, rx).await
    }

    /// Run the pipeline, aborting at the first opportunity once `abort`
    /// observes `true`. The in-flight stage is interrupted (its child
    /// process is killed) and the run transitions to `FailedFast`.
    pub async fn run_with_abort(
        &self,
        config: &GantryConfig,
        mut abort: watch::Receiver<bool>,
    ) -> Result<PipelineRun> {
        config.validate()?;

        let mut run = PipelineRun::new();
        run.start()?;

        let digest = config.stages_digest();
        info!(run_id = %run.id, pipeline = &digest[..12], stages = config.stages.len(), "starting pipeline run");

        let gate = config.cache.as_ref().map(CacheGate::from_config);
        let mut cache_state = config.cache.as_ref().map(CacheState::from_config);
        let remote = RemoteExecutor::new(self.transport.clone()).with_backoff(self.retry_backoff);
        let aggregator = LogAggregator::new(remote.clone(), config.remote.clone());

        let mut failed_fast = false;
        let mut warnings = false;
        let mut aborted = *abort.borrow();

        for stage in &config.stages {
            if aborted {
                break;
            }
            if !stage.enabled {
                info!(stage = %stage.name, "skipping disabled stage");
                run.record(ExecutionResult::skipped(stage, "stage disabled"))?;
                continue;
            }

            info!(stage = %stage.name, ordinal = stage.ordinal, "executing stage");

            let result = tokio::select! {
                biased;
                _ = abort_observed(&mut abort) => {
                    warn!(stage = %stage.name, "abort signal received, interrupting stage");
                    aborted = true;
                    ExecutionResult::failed(stage, "aborted by external signal")
                }
                result = self.execute_stage(
                    stage,
                    config,
                    gate.as_ref(),
                    cache_state.as_mut(),
                    &remote,
                    &aggregator,
                ) => result,
            };

            // A scan that ran without a fresh cache finishes the run as
            // completed-with-warnings even when the scan itself passed.
            if matches!(stage.kind, StageKind::Scan { .. }) {
                if let Some(state) = &cache_state {
                    if state.readiness.is_some_and(|r| r != CacheReadiness::Ready) {
                        warnings = true;
                    }
                }
            }

            let classification = result.classification;
            run.record(result)?;

            if aborted {
                break;
            }

            if classification.is_failure() {
                match stage.abort_policy {
                    AbortPolicy::AbortOnFailure => {
                        warn!(stage = %stage.name, "stage failed, aborting pipeline");
                        failed_fast = true;
                        break;
                    }
                    AbortPolicy::ContinueOnFailure => {
                        warn!(stage = %stage.name, "stage failed, continuing");
                        warnings = true;
                    }
                    AbortPolicy::BestEffort => {
                        info!(stage = %stage.name, "best-effort stage failed, ignoring");
                    }
                }
            }
        }

        let final_state = if aborted || failed_fast {
            RunState::FailedFast
        } else if warnings {
            RunState::CompletedWithWarnings
        } else {
            RunState::Succeeded
        };
        run.finalize(final_state)?;

        info!(run_id = %run.id, state = %run.state, attempted = run.results.len(), "pipeline run finished");
        self.notifier.notify(&run).await;

        Ok(run)
    }

    async fn execute_stage(
        &self,
        stage: &Stage,
        config: &GantryConfig,
        gate: Option<&CacheGate>,
        cache_state: Option<&mut CacheState>,
        remote: &RemoteExecutor,
        aggregator: &LogAggregator,
    ) -> ExecutionResult {
        match &stage.kind {
            StageKind::Local { command } => self.run_local(stage, command).await,
            StageKind::Remote { command } => match &config.remote {
                Some(target) => remote.exec(target, stage, command).await,
                None => ExecutionResult::failed(stage, "no remote target configured"),
            },
            StageKind::Scan {
                command,
                degraded_args,
            } => {
                self.run_scan(stage, config, gate, cache_state, command, degraded_args)
                    .await
            }
            StageKind::Collect => self.run_collect(stage, config, aggregator).await,
        }
    }

    /// Local command, retried at most once when the stage opts in
    /// (registry push). Only completed command failures retry; timeouts
    /// and failures where no command ran (missing credential, spawn
    /// error) do not.
    async fn run_local(&self, stage: &Stage, command: &[String]) -> ExecutionResult {
        let first = StageRunner::run(stage, command).await;
        if first.classification != Classification::Failure
            || !stage.retry_once
            || first.exit_code.is_none()
        {
            return first;
        }

        warn!(stage = %stage.name, "stage failed, retrying once");
        let mut second = StageRunner::run(stage, command).await;
        second.note = Some(match second.note.take() {
            Some(note) => format!("retried once; {}", note),
            None => "retried once after failure".to_string(),
        });
        second
    }

    async fn run_scan(
        &self,
        stage: &Stage,
        config: &GantryConfig,
        gate: Option<&CacheGate>,
        cache_state: Option<&mut CacheState>,
        command: &[String],
        degraded_args: &[String],
    ) -> ExecutionResult {
        let (gate, state) = match (gate, cache_state) {
            (Some(gate), Some(state)) => (gate, state),
            // validate() rejects this config, but a result beats a panic.
            _ => return ExecutionResult::failed(stage, "scan stage without cache configuration"),
        };

        let policy = config.cache.as_ref().map(|c| c.policy).unwrap_or_default();
        match gate.ensure_ready(state).await {
            CacheReadiness::Ready => {
                let result = StageRunner::run(stage, command).await;
                apply_scan_exit_policy(config, result, None)
            }
            CacheReadiness::Degraded => {
                let full: Vec<String> = command
                    .iter()
                    .chain(degraded_args.iter())
                    .cloned()
                    .collect();
                let result = StageRunner::run(stage, &full).await;
                apply_scan_exit_policy(config, result, Some("degraded mode: cache update skipped"))
            }
            CacheReadiness::Unavailable => match policy {
                CachePolicy::Strict => {
                    ExecutionResult::failed(stage, "cache unavailable under strict policy")
                }
                CachePolicy::Lenient => ExecutionResult::skipped(
                    stage,
                    "cache unavailable, scan skipped under lenient policy",
                ),
            },
        }
    }

    /// Aggregation is bounded by the collect stage's timeout like any
    /// other stage; a hanging remote source cannot stall the run.
    async fn run_collect(
        &self,
        stage: &Stage,
        config: &GantryConfig,
        aggregator: &LogAggregator,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let work = aggregator.aggregate(&config.log_sources);
        let artifact = if stage.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(stage.timeout_secs), work).await {
                Ok(artifact) => artifact,
                Err(_) => {
                    warn!(stage = %stage.name, timeout_secs = stage.timeout_secs, "log aggregation timed out");
                    return ExecutionResult {
                        stage_name: stage.name.clone(),
                        ordinal: stage.ordinal,
                        classification: Classification::TimedOut,
                        exit_code: None,
                        stdout: CapturedOutput::empty(),
                        stderr: CapturedOutput::empty(),
                        duration_ms: start.elapsed().as_millis() as u64,
                        started_at,
                        note: Some(format!(
                            "log aggregation timed out after {}s",
                            stage.timeout_secs
                        )),
                    };
                }
            }
        } else {
            work.await
        };

        match artifact.write_to(&config.artifact_path) {
            Ok(()) => ExecutionResult {
                stage_name: stage.name.clone(),
                ordinal: stage.ordinal,
                classification: Classification::Success,
                exit_code: None,
                stdout: CapturedOutput::empty(),
                stderr: CapturedOutput::empty(),
                duration_ms: start.elapsed().as_millis() as u64,
                started_at,
                note: Some(format!(
                    "aggregated {} sections ({} unavailable) into {}, sha256 {}",
                    artifact.sections,
                    artifact.missing_required,
                    config.artifact_path.display(),
                    &artifact.digest[..12],
                )),
            },
            Err(e) => ExecutionResult::failed(
                stage,
                format!(
                    "failed to write artifact {}: {}",
                    config.artifact_path.display(),
                    e
                ),
            ),
        }
    }
}

/// Resolves once the abort flag becomes `true`; never resolves if the
/// sender is dropped without signalling.
async fn abort_observed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Under advisory exit policy, scanner findings are reported but do not
/// fail the stage; under gating policy the non-zero exit stands.
fn apply_scan_exit_policy(
    config: &GantryConfig,
    mut result: ExecutionResult,
    mode_note: Option<&str>,
) -> ExecutionResult {
    if result.classification == Classification::Failure
        && result.exit_code.is_some_and(|code| code != 0)
        && config.scanner.exit_policy == ExitPolicy::Advisory
    {
        let advisory = format!(
            "advisory: scanner reported findings (exit {})",
            result.exit_code.unwrap_or(-1)
        );
        result.classification = Classification::Success;
        result.note = Some(match result.note.take() {
            Some(note) => format!("{}; {}", advisory, note),
            None => advisory,
        });
    }

    if let Some(mode) = mode_note {
        result.note = Some(match result.note.take() {
            Some(note) => format!("{}; {}", note, mode),
            None => mode.to_string(),
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::fakes::RecordingNotifier;
    use crate::transport::fakes::ScriptedTransport;
    use crate::transport::{RemoteOutput, TransportOutcome};
    use async_trait::async_trait;
    use gantry_core::{CredentialRef, LogOrigin, LogSource, RemoteTarget, ScannerConfig};

    /// Transport whose sessions never come back in test time.
    struct StallingTransport;

    #[async_trait]
    impl CommandTransport for StallingTransport {
        async fn exec(&self, _target: &RemoteTarget, _command: &str) -> TransportOutcome {
            tokio::time::sleep(Duration::from_secs(300)).await;
            TransportOutcome::Completed(RemoteOutput {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn engine_with(
        transport: Arc<ScriptedTransport>,
        notifier: Arc<RecordingNotifier>,
    ) -> PipelineEngine {
        PipelineEngine::new(transport, notifier).with_retry_backoff(Duration::from_millis(1))
    }

    fn local(name: &str, ordinal: usize, command: &[&str]) -> Stage {
        Stage::local(
            name,
            ordinal,
            command.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn config_of(stages: Vec<Stage>) -> GantryConfig {
        GantryConfig {
            stages,
            remote: None,
            cache: None,
            scanner: ScannerConfig::default(),
            log_sources: Vec::new(),
            artifact_path: std::env::temp_dir().join("gantry-engine-test-artifact.txt"),
            notify_url: None,
        }
    }

    #[tokio::test]
    async fn test_all_stages_pass() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![
            local("build", 0, &["echo", "built"]),
            local("test", 1, &["echo", "tested"]),
        ]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.passed_count(), 2);
    }

    #[tokio::test]
    async fn test_abort_on_failure_skips_remaining_stages() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![
            local("build", 0, &["echo", "built"]),
            local("test", 1, &["false"]),
            local("publish", 2, &["echo", "never"]),
        ]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.state, RunState::FailedFast);
        // Results are the prefix up to and including the aborting stage.
        assert_eq!(run.results.len(), 2);
        assert_eq!(run.results[1].stage_name, "test");
    }

    #[tokio::test]
    async fn test_continue_on_failure_yields_warnings() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![
            local("build", 0, &["echo", "built"]),
            local("static-analysis", 1, &["false"]).with_policy(AbortPolicy::ContinueOnFailure),
            local("publish", 2, &["echo", "published"]),
        ]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.state, RunState::CompletedWithWarnings);
        assert_eq!(run.results.len(), 3);
    }

    #[tokio::test]
    async fn test_best_effort_failure_does_not_affect_state() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![
            local("build", 0, &["echo", "built"]),
            local("cleanup", 1, &["false"]).with_policy(AbortPolicy::BestEffort),
        ]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.failed_count(), 1);
    }

    #[tokio::test]
    async fn test_notification_fires_exactly_once_with_terminal_state() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![local("build", 0, &["false"])]);
        let run = engine.run(&config).await.expect("run");

        let notifications = notifier.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, run.id.to_string());
        assert_eq!(notifications[0].1, RunState::FailedFast);
    }

    #[tokio::test]
    async fn test_disabled_stage_recorded_as_skipped() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![
            local("build", 0, &["echo", "built"]),
            local("publish", 1, &["false"]).disabled(),
            local("collect", 2, &["echo", "collected"]),
        ]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.results[1].classification, Classification::Skipped);
    }

    #[tokio::test]
    async fn test_abort_signal_interrupts_stage_and_fails_fast() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let config = config_of(vec![
            local("build", 0, &["echo", "built"]),
            local("slow", 1, &["sleep", "30"]).with_timeout(60),
            local("never", 2, &["echo", "never"]),
        ]);

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let run = engine.run_with_abort(&config, rx).await.expect("run");
        assert_eq!(run.state, RunState::FailedFast);
        assert_eq!(run.results.len(), 2, "interrupted stage still gets its result");
        assert_eq!(run.results[1].classification, Classification::Failure);
        assert!(run.results[1]
            .note
            .as_deref()
            .unwrap_or("")
            .contains("aborted"));
    }

    #[tokio::test]
    async fn test_missing_credential_failure_not_retried() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let mut push = local("image-push", 0, &["true"]);
        push.retry_once = true;
        push.credential = Some(CredentialRef("GANTRY_ENGINE_ABSENT_TOKEN".to_string()));
        let config = config_of(vec![push]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.state, RunState::FailedFast);
        let note = run.results[0].note.as_deref().unwrap_or("");
        assert!(note.contains("GANTRY_ENGINE_ABSENT_TOKEN"));
        assert!(
            !note.contains("retried"),
            "a failure before any command ran must not retry"
        );
    }

    #[tokio::test]
    async fn test_collect_stage_bounded_by_timeout() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = PipelineEngine::new(Arc::new(StallingTransport), notifier.clone())
            .with_retry_backoff(Duration::from_millis(1));

        let mut collect = local("collect-logs", 0, &[]);
        collect.kind = StageKind::Collect;
        collect.timeout_secs = 1;
        collect.abort_policy = AbortPolicy::BestEffort;

        let mut config = config_of(vec![collect]);
        config.remote = Some(RemoteTarget {
            host: "deploy.example.com".to_string(),
            user: "release".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 5,
        });
        config.log_sources = vec![LogSource {
            header: "pod log".to_string(),
            origin: LogOrigin::RemoteFile {
                path: "/var/log/app.pipe".to_string(),
            },
            optional: false,
        }];

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.results[0].classification, Classification::TimedOut);
        assert!(run.results[0]
            .note
            .as_deref()
            .unwrap_or("")
            .contains("timed out"));
        assert_eq!(run.state, RunState::Succeeded, "best-effort stage outcome is ignored");
    }

    #[tokio::test]
    async fn test_retry_once_stage_produces_single_result() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(ScriptedTransport::new(vec![])), notifier.clone());

        let mut push = local("image-push", 0, &["false"]);
        push.retry_once = true;
        let config = config_of(vec![push]);

        let run = engine.run(&config).await.expect("run");
        assert_eq!(run.results.len(), 1, "retry must not duplicate the result");
        assert!(run.results[0]
            .note
            .as_deref()
            .unwrap_or("")
            .contains("retried once"));
    }
}
