//! Gantry - release pipeline orchestrator CLI
//!
//! The `gantry` command drives a release pipeline from checkout to
//! deployment and log collection.
//!
//! ## Commands
//!
//! - `run`: Execute a pipeline definition end to end
//! - `plan`: Show the resolved stage sequence without executing it
//! - `aggregate-logs`: Merge the configured log sources into one artifact

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use gantry_core::{GantryConfig, RunState, StageKind};
use gantry_pipeline::{
    LogAggregator, NoopNotifier, Notifier, PipelineEngine, RemoteExecutor, SshTransport,
    WebhookNotifier,
};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Release pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition end to end
    Run {
        /// Pipeline definition file (default: the built-in release catalog)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Image reference for the built-in catalog
        #[arg(long, default_value = "registry.local/app:latest")]
        image: String,

        /// Deployment manifest for the built-in catalog
        #[arg(long, default_value = "app.yaml")]
        manifest: String,

        /// Print the finished run as JSON instead of a summary table
        #[arg(long)]
        report_json: bool,
    },

    /// Show the resolved stage sequence without executing it
    Plan {
        /// Pipeline definition file (default: the built-in release catalog)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Image reference for the built-in catalog
        #[arg(long, default_value = "registry.local/app:latest")]
        image: String,

        /// Deployment manifest for the built-in catalog
        #[arg(long, default_value = "app.yaml")]
        manifest: String,
    },

    /// Merge the configured log sources into one artifact
    AggregateLogs {
        /// Pipeline definition file
        #[arg(short, long)]
        config: PathBuf,

        /// Output path (overrides the configured artifact path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    gantry_core::telemetry::init_tracing(cli.json, cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            image,
            manifest,
            report_json,
        } => {
            let config = load_config(config.as_deref(), &image, &manifest)?;
            cmd_run(&config, report_json).await
        }
        Commands::Plan {
            config,
            image,
            manifest,
        } => {
            let config = load_config(config.as_deref(), &image, &manifest)?;
            cmd_plan(&config)
        }
        Commands::AggregateLogs { config, output } => {
            let config = GantryConfig::load(&config).context("failed to load pipeline config")?;
            cmd_aggregate_logs(&config, output.as_deref()).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>, image: &str, manifest: &str) -> Result<GantryConfig> {
    match path {
        Some(path) => GantryConfig::load(path).context("failed to load pipeline config"),
        None => Ok(GantryConfig::builtin_release(image, manifest)),
    }
}

/// Execute the pipeline, aborting in flight on Ctrl-C.
async fn cmd_run(config: &GantryConfig, report_json: bool) -> Result<()> {
    let transport = Arc::new(SshTransport::new());
    let notifier: Arc<dyn Notifier> = match &config.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };
    let engine = PipelineEngine::new(transport, notifier);

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting pipeline");
            let _ = abort_tx.send(true);
        }
    });

    let run = engine
        .run_with_abort(config, abort_rx)
        .await
        .context("pipeline run failed")?;

    if report_json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run_report(&run);
    }

    if run.state == RunState::FailedFast {
        anyhow::bail!("pipeline failed");
    }
    Ok(())
}

fn print_run_report(run: &gantry_core::PipelineRun) {
    println!("Run ID: {}", run.id);
    println!("State:  {}", run.state);
    println!();

    for result in &run.results {
        let marker = match result.classification {
            gantry_core::Classification::Success => "✓",
            gantry_core::Classification::Skipped => "-",
            _ => "✗",
        };
        let exit = result
            .exit_code
            .map(|c| format!("exit {}", c))
            .unwrap_or_else(|| "no exit code".to_string());
        print!(
            "  {} {} ({}ms, {})",
            marker, result.stage_name, result.duration_ms, exit
        );
        if let Some(note) = &result.note {
            print!(" [{}]", note);
        }
        println!();
    }

    let summary = run.summary();
    println!();
    println!(
        "Summary: {}/{} passed, {} failed, {} skipped ({}ms)",
        summary.succeeded, summary.total, summary.failed, summary.skipped, summary.duration_ms
    );
}

/// Print the resolved stage sequence without executing anything.
fn cmd_plan(config: &GantryConfig) -> Result<()> {
    config.validate().context("invalid pipeline config")?;

    println!("Pipeline: {}", &config.stages_digest()[..12]);
    println!();

    for stage in &config.stages {
        let kind = match &stage.kind {
            StageKind::Local { command } => format!("local: {}", command.join(" ")),
            StageKind::Remote { command } => format!("remote: {}", command),
            StageKind::Scan { command, .. } => format!("scan: {}", command.join(" ")),
            StageKind::Collect => "collect logs".to_string(),
        };
        let flags = if stage.enabled { "" } else { " (disabled)" };
        println!(
            "  [{}] {} ({:?}, {}s timeout){}",
            stage.ordinal, stage.name, stage.abort_policy, stage.timeout_secs, flags
        );
        println!("      {}", kind);
    }

    if let Some(remote) = &config.remote {
        println!();
        println!("Remote: {}@{}:{}", remote.user, remote.host, remote.port);
    }
    if let Some(cache) = &config.cache {
        println!("Cache:  {} ({:?})", cache.root.display(), cache.policy);
    }

    Ok(())
}

/// Run only the log aggregation step and write the artifact.
async fn cmd_aggregate_logs(
    config: &GantryConfig,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let transport = Arc::new(SshTransport::new());
    let remote = RemoteExecutor::new(transport);
    let aggregator = LogAggregator::new(remote, config.remote.clone());

    let artifact = aggregator.aggregate(&config.log_sources).await;
    let path = output.unwrap_or(&config.artifact_path);
    artifact
        .write_to(path)
        .with_context(|| format!("failed to write artifact to {:?}", path))?;

    println!("Wrote {} sections to {:?}", artifact.sections, path);
    println!("Digest: {}", artifact.digest);
    if artifact.missing_required > 0 {
        println!("Missing required sources: {}", artifact.missing_required);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_plan_is_valid() {
        let config = load_config(None, "registry.local/app:1.0", "app.yaml").unwrap();
        assert_eq!(config.stages.len(), 10);
        assert!(cmd_plan(&config).is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.json");
        std::fs::write(
            &path,
            r#"{"stages": [{"name": "build", "ordinal": 0, "kind": "local", "command": ["make"]}]}"#,
        )
        .unwrap();

        let config = load_config(Some(&path), "unused", "unused").unwrap();
        assert_eq!(config.stages.len(), 1);
        assert_eq!(config.stages[0].name, "build");
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("nope.json")), "unused", "unused");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_aggregate_logs_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        std::fs::write(&log, "compiled\n").unwrap();

        let config = GantryConfig {
            stages: vec![],
            remote: None,
            cache: None,
            scanner: Default::default(),
            log_sources: vec![gantry_core::LogSource {
                header: "build log".to_string(),
                origin: gantry_core::LogOrigin::LocalFile { path: log },
                optional: false,
            }],
            artifact_path: dir.path().join("artifact.txt"),
            notify_url: None,
        };

        cmd_aggregate_logs(&config, None).await.unwrap();
        let artifact = std::fs::read_to_string(dir.path().join("artifact.txt")).unwrap();
        assert!(artifact.contains("compiled"));
    }
}
