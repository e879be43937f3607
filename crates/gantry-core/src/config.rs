//! Pipeline configuration and identity.
//!
//! A pipeline is defined in a `gantry.json` file: the ordered stage
//! list plus the remote target, cache gate settings, scanner policy,
//! log sources, and the notification endpoint. The built-in release
//! catalog covers the canonical checkout-to-deploy sequence so a config
//! file only has to override what differs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::stage::{AbortPolicy, Stage, StageKind};

/// Opaque reference to a credential: the name of an environment
/// variable holding the secret. The secret itself is resolved at spawn
/// time and never stored in configuration, results, or logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CredentialRef(pub String);

impl CredentialRef {
    /// Resolve the secret from the orchestrator's environment.
    pub fn resolve(&self) -> Option<String> {
        std::env::var(&self.0).ok()
    }

    /// The environment variable name this reference points at.
    pub fn var_name(&self) -> &str {
        &self.0
    }
}

/// Remote host reached over SSH. Immutable, supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

/// Strictness of the scan stage when the cache cannot be bootstrapped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Bootstrap failure on an absent cache aborts the scan stage.
    Strict,

    /// Bootstrap failure on an absent cache skips scanning with a warning.
    Lenient,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Lenient
    }
}

/// Vulnerability database cache settings consulted by the cache gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory.
    pub root: PathBuf,

    /// Marker file (relative to root) whose mtime defines freshness.
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Marker older than this is stale.
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,

    #[serde(default)]
    pub policy: CachePolicy,

    /// Command that populates the cache (run at most once per gate check).
    pub bootstrap: Vec<String>,
}

fn default_marker() -> String {
    "metadata/last_update".to_string()
}

fn default_staleness() -> u64 {
    24 * 60 * 60
}

/// Finding severities passed to the scanner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// What a non-zero scanner exit does to the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Findings are reported but the stage succeeds.
    Advisory,

    /// Non-zero exit on findings propagates as a stage failure.
    Gating,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        ExitPolicy::Advisory
    }
}

/// Scanner invocation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_severities")]
    pub severities: Vec<Severity>,

    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

fn default_severities() -> Vec<Severity> {
    vec![Severity::High, Severity::Critical]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            severities: default_severities(),
            exit_policy: ExitPolicy::default(),
        }
    }
}

impl ScannerConfig {
    /// Comma-joined severity filter as the scanner CLI expects it.
    pub fn severity_filter(&self) -> String {
        self.severities
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Where one log source's content comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum LogOrigin {
    LocalFile { path: PathBuf },
    RemoteFile { path: String },
    InlineReport { content: String },
}

/// One entry in the fixed, ordered aggregation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSource {
    /// Section header written before this source's content.
    pub header: String,

    #[serde(flatten)]
    pub origin: LogOrigin,

    /// Missing optional sources are omitted with a note instead of an
    /// error marker.
    #[serde(default)]
    pub optional: bool,
}

/// Complete pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GantryConfig {
    pub stages: Vec<Stage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub log_sources: Vec<LogSource>,

    /// Path the aggregated log artifact is written to.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,

    /// Fire-and-forget notification endpoint for terminal run state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("gantry-logs.txt")
}

impl GantryConfig {
    /// Load and validate a pipeline definition from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: GantryConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the stage list is well-formed before the pipeline is built.
    ///
    /// Disabled stages keep their slot in the sequence but do not
    /// require their backing configuration; they only record a skipped
    /// result.
    pub fn validate(&self) -> Result<()> {
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.ordinal != idx {
                return Err(PipelineError::Config(format!(
                    "stage '{}' has ordinal {} at position {}",
                    stage.name, stage.ordinal, idx
                )));
            }
            if self.stages[..idx].iter().any(|s| s.name == stage.name) {
                return Err(PipelineError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if !stage.enabled {
                continue;
            }
            if matches!(stage.kind, StageKind::Remote { .. }) && self.remote.is_none() {
                return Err(PipelineError::Config(format!(
                    "stage '{}' is remote but no remote target is configured",
                    stage.name
                )));
            }
            if matches!(stage.kind, StageKind::Scan { .. }) && self.cache.is_none() {
                return Err(PipelineError::Config(format!(
                    "stage '{}' is a scan but no cache is configured",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    /// Deterministic digest of the ordered stage names, used as the
    /// pipeline's identity in notifications and reports.
    pub fn stages_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for stage in &self.stages {
            hasher.update(stage.name.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    /// The canonical release sequence: checkout, build, test, static
    /// analysis, publish, image build, scan, push, deploy, log collection.
    ///
    /// The catalog validates as shipped: it carries a default scanner
    /// cache, and the deploy stage is disabled until a remote target is
    /// configured.
    pub fn builtin_release(image: &str, manifest: &str) -> Self {
        let scanner = ScannerConfig::default();
        let severity = scanner.severity_filter();
        let stages = vec![
            Stage::local("checkout", 0, split("git checkout -f")),
            Stage::local("build", 1, split("mvn -B -DskipTests package")),
            Stage::local("unit-test", 2, split("mvn -B test")),
            Stage::local("static-analysis", 3, split("mvn -B sonar:sonar"))
                .with_policy(AbortPolicy::ContinueOnFailure),
            Stage::local("publish", 4, split("mvn -B deploy -DskipTests")),
            Stage::local(
                "image-build",
                5,
                vec![
                    "docker".to_string(),
                    "build".to_string(),
                    "-t".to_string(),
                    image.to_string(),
                    ".".to_string(),
                ],
            ),
            Stage {
                name: "vuln-scan".to_string(),
                ordinal: 6,
                kind: StageKind::Scan {
                    command: vec![
                        "trivy".to_string(),
                        "image".to_string(),
                        "--severity".to_string(),
                        severity,
                        image.to_string(),
                    ],
                    degraded_args: vec!["--skip-db-update".to_string()],
                },
                timeout_secs: 600,
                abort_policy: AbortPolicy::ContinueOnFailure,
                env: Default::default(),
                credential: None,
                retry_once: false,
                enabled: true,
            },
            Stage {
                name: "image-push".to_string(),
                ordinal: 7,
                kind: StageKind::Local {
                    command: vec!["docker".to_string(), "push".to_string(), image.to_string()],
                },
                timeout_secs: 600,
                abort_policy: AbortPolicy::AbortOnFailure,
                env: Default::default(),
                credential: Some(CredentialRef("REGISTRY_TOKEN".to_string())),
                retry_once: true,
                enabled: true,
            },
            Stage::remote("deploy", 8, &format!("kubectl apply -f {}", manifest)).disabled(),
            Stage {
                name: "collect-logs".to_string(),
                ordinal: 9,
                kind: StageKind::Collect,
                timeout_secs: 120,
                abort_policy: AbortPolicy::BestEffort,
                env: Default::default(),
                credential: None,
                retry_once: false,
                enabled: true,
            },
        ];

        Self {
            stages,
            remote: None,
            cache: Some(CacheConfig {
                root: PathBuf::from("/var/cache/trivy"),
                marker: default_marker(),
                staleness_secs: default_staleness(),
                policy: CachePolicy::default(),
                bootstrap: vec![
                    "trivy".to_string(),
                    "image".to_string(),
                    "--download-db-only".to_string(),
                ],
            }),
            scanner,
            log_sources: Vec::new(),
            artifact_path: default_artifact_path(),
            notify_url: None,
        }
    }
}

fn split(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_release_valid_as_shipped() {
        let config = GantryConfig::builtin_release("registry.local/app:1.0", "app.yaml");
        config.validate().expect("builtin catalog must validate");
        assert_eq!(config.stages.len(), 10);
        assert!(config.cache.is_some(), "catalog carries a scanner cache");

        let deploy = config
            .stages
            .iter()
            .find(|s| s.name == "deploy")
            .expect("deploy stage");
        assert!(!deploy.enabled, "deploy ships disabled without a target");
    }

    #[test]
    fn test_builtin_release_deploy_enabled_with_remote() {
        let mut config = GantryConfig::builtin_release("registry.local/app:1.0", "app.yaml");
        config.remote = Some(RemoteTarget {
            host: "deploy.example.com".to_string(),
            user: "release".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
        });
        for stage in &mut config.stages {
            if stage.name == "deploy" {
                stage.enabled = true;
            }
        }
        config.validate().expect("catalog with remote target validates");
    }

    #[test]
    fn test_validate_skips_disabled_stage_requirements() {
        let config = GantryConfig {
            stages: vec![Stage::remote("deploy", 0, "kubectl apply -f app.yaml").disabled()],
            remote: None,
            cache: None,
            scanner: ScannerConfig::default(),
            log_sources: Vec::new(),
            artifact_path: default_artifact_path(),
            notify_url: None,
        };
        config
            .validate()
            .expect("disabled remote stage needs no target");
    }

    #[test]
    fn test_validate_rejects_remote_stage_without_target() {
        let config = GantryConfig {
            stages: vec![Stage::remote("deploy", 0, "kubectl apply -f app.yaml")],
            remote: None,
            cache: None,
            scanner: ScannerConfig::default(),
            log_sources: Vec::new(),
            artifact_path: default_artifact_path(),
            notify_url: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config = GantryConfig {
            stages: vec![
                Stage::local("build", 0, vec!["true".to_string()]),
                Stage::local("build", 1, vec!["true".to_string()]),
            ],
            remote: None,
            cache: None,
            scanner: ScannerConfig::default(),
            log_sources: Vec::new(),
            artifact_path: default_artifact_path(),
            notify_url: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ordinal() {
        let config = GantryConfig {
            stages: vec![Stage::local("build", 3, vec!["true".to_string()])],
            remote: None,
            cache: None,
            scanner: ScannerConfig::default(),
            log_sources: Vec::new(),
            artifact_path: default_artifact_path(),
            notify_url: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stages_digest_order_sensitive() {
        let a = GantryConfig {
            stages: vec![
                Stage::local("build", 0, vec!["true".to_string()]),
                Stage::local("test", 1, vec!["true".to_string()]),
            ],
            remote: None,
            cache: None,
            scanner: ScannerConfig::default(),
            log_sources: Vec::new(),
            artifact_path: default_artifact_path(),
            notify_url: None,
        };
        let mut b = a.clone();
        b.stages[0].name = "test".to_string();
        b.stages[1].name = "build".to_string();
        assert_ne!(a.stages_digest(), b.stages_digest());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gantry.json");
        let mut file = std::fs::File::create(&path).expect("create");
        write!(
            file,
            r#"{{
                "stages": [
                    {{"name": "build", "ordinal": 0, "kind": "local", "command": ["make"]}}
                ],
                "scanner": {{"exit_policy": "gating"}}
            }}"#
        )
        .expect("write");

        let config = GantryConfig::load(&path).expect("load");
        assert_eq!(config.stages.len(), 1);
        assert_eq!(config.scanner.exit_policy, ExitPolicy::Gating);
        assert_eq!(config.scanner.severity_filter(), "HIGH,CRITICAL");
    }

    #[test]
    fn test_credential_ref_resolves_from_env() {
        std::env::set_var("GANTRY_TEST_CRED", "s3cret");
        let cred = CredentialRef("GANTRY_TEST_CRED".to_string());
        assert_eq!(cred.resolve().as_deref(), Some("s3cret"));
        assert_eq!(cred.var_name(), "GANTRY_TEST_CRED");
        std::env::remove_var("GANTRY_TEST_CRED");
    }
}
