//! Merges heterogeneous log sources into one ordered artifact.
//!
//! Aggregation is best-effort by design: its output feeds an advisory
//! analysis step, not a release gate. A source that cannot be resolved
//! degrades to an explicit marker inside the artifact instead of
//! aborting the remaining sources. Remote sources go through the
//! executor, so they inherit its retry policy and are bounded by a
//! per-fetch timeout.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use gantry_core::{LogOrigin, LogSource, RemoteTarget};

use crate::remote::{RemoteExecutor, RemoteOutcome};

/// Upper bound on one remote log fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// The merged artifact and its content digest.
#[derive(Debug, Clone)]
pub struct LogArtifact {
    pub content: String,
    pub digest: String,
    pub sections: usize,
    pub missing_required: usize,
}

impl LogArtifact {
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.content)
    }
}

pub struct LogAggregator {
    remote: RemoteExecutor,
    target: Option<RemoteTarget>,
    fetch_timeout: Duration,
}

impl LogAggregator {
    pub fn new(remote: RemoteExecutor, target: Option<RemoteTarget>) -> Self {
        Self {
            remote,
            target,
            fetch_timeout: FETCH_TIMEOUT,
        }
    }

    /// Override the per-fetch timeout (tests use a short one).
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Resolve each source exactly once, in the configured order.
    pub async fn aggregate(&self, sources: &[LogSource]) -> LogArtifact {
        let mut content = String::new();
        let mut missing_required = 0;

        for source in sources {
            content.push_str(&format!("===== {} =====\n", source.header));

            match self.resolve(source).await {
                Ok(text) => {
                    content.push_str(&text);
                    if !text.ends_with('\n') {
                        content.push('\n');
                    }
                }
                Err(detail) if source.optional => {
                    debug!(header = %source.header, "optional source missing: {}", detail);
                    content.push_str(&format!("[note] optional source not present: {}\n", detail));
                }
                Err(detail) => {
                    warn!(header = %source.header, "required source missing: {}", detail);
                    missing_required += 1;
                    content.push_str(&format!("[ERROR] source unavailable: {}\n", detail));
                }
            }
        }

        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        LogArtifact {
            content,
            digest,
            sections: sources.len(),
            missing_required,
        }
    }

    async fn resolve(&self, source: &LogSource) -> Result<String, String> {
        match &source.origin {
            LogOrigin::InlineReport { content } => Ok(content.clone()),
            LogOrigin::LocalFile { path } => std::fs::read_to_string(path)
                .map_err(|e| format!("{}: {}", path.display(), e)),
            LogOrigin::RemoteFile { path } => {
                let target = self
                    .target
                    .as_ref()
                    .ok_or_else(|| format!("{}: no remote target configured", path))?;
                let command = format!("cat {}", shell_quote(path));
                let attempt = self
                    .remote
                    .run(target, &command, Some(self.fetch_timeout))
                    .await;
                match attempt.outcome {
                    RemoteOutcome::Completed(out) if out.success() => {
                        Ok(String::from_utf8_lossy(&out.stdout).to_string())
                    }
                    RemoteOutcome::Completed(out) => Err(format!(
                        "{}: remote read exited {}",
                        path, out.exit_code
                    )),
                    RemoteOutcome::AuthFailure(detail) => {
                        Err(format!("{}: auth failure: {}", path, detail))
                    }
                    RemoteOutcome::NetworkFailure(detail) => {
                        Err(format!("{}: network failure: {}", path, detail))
                    }
                    RemoteOutcome::TimedOut => Err(format!(
                        "{}: remote read timed out after {}s",
                        path,
                        self.fetch_timeout.as_secs()
                    )),
                }
            }
        }
    }
}

/// Single-quote a path for the remote shell.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}
