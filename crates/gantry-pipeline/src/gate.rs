//! Cache gate for the vulnerability scan stage.
//!
//! Decides whether the scanner's database cache is usable before the
//! scan runs in full mode. The decision table:
//!
//! | marker state     | behavior                                        |
//! |------------------|-------------------------------------------------|
//! | present & fresh  | `Ready`, no bootstrap                           |
//! | present & stale  | bootstrap once; on failure `Degraded`           |
//! | absent           | bootstrap once; on failure `Unavailable`        |
//!
//! Strict vs lenient policy is applied by the engine when it maps
//! `Unavailable` onto the scan stage's result. The cache root is the
//! one mutable resource shared between concurrent runs, so bootstrap is
//! serialized through a lock file in the root.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use gantry_core::{CacheConfig, CacheReadiness, CacheState};
use gantry_core::cache::MarkerState;

/// Lock file name inside the cache root.
const LOCK_FILE: &str = ".gantry.lock";

/// A lock older than this is assumed abandoned and taken over.
const STALE_LOCK_AGE: Duration = Duration::from_secs(15 * 60);

pub struct CacheGate {
    bootstrap: Vec<String>,
    bootstrap_timeout: Duration,
    lock_wait: Duration,
}

impl CacheGate {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            bootstrap: config.bootstrap.clone(),
            bootstrap_timeout: Duration::from_secs(300),
            lock_wait: Duration::from_secs(60),
        }
    }

    /// Shorten the lock wait (tests use a small value).
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Evaluate cache readiness, bootstrapping at most once.
    ///
    /// Mutates `state`: records the check timestamp and the readiness
    /// verdict the scan stage reads afterward.
    pub async fn ensure_ready(&self, state: &mut CacheState) -> CacheReadiness {
        state.last_checked = Some(Utc::now());

        let readiness = match state.marker_state() {
            MarkerState::Fresh => {
                debug!(marker = %state.marker.display(), "cache marker fresh, full mode");
                CacheReadiness::Ready
            }
            MarkerState::Stale => {
                info!(marker = %state.marker.display(), "cache marker stale, bootstrapping");
                if self.bootstrap_once(state).await {
                    CacheReadiness::Ready
                } else {
                    warn!("cache bootstrap failed, proceeding in degraded mode");
                    CacheReadiness::Degraded
                }
            }
            MarkerState::Absent => {
                info!(marker = %state.marker.display(), "cache marker absent, bootstrapping");
                if self.bootstrap_once(state).await {
                    CacheReadiness::Ready
                } else {
                    warn!("cache bootstrap failed, cache unavailable");
                    CacheReadiness::Unavailable
                }
            }
        };

        state.readiness = Some(readiness);
        readiness
    }

    /// Run the bootstrap command once under the cache root lock.
    async fn bootstrap_once(&self, state: &CacheState) -> bool {
        if self.bootstrap.is_empty() {
            return false;
        }

        let _lock = match CacheLock::acquire(&state.root, self.lock_wait).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(root = %state.root.display(), "could not lock cache root: {}", e);
                return false;
            }
        };

        // Another run may have bootstrapped while we waited on the lock.
        if state.marker_state() == MarkerState::Fresh {
            return true;
        }

        let (exe, args) = match self.bootstrap.split_first() {
            Some(split) => split,
            None => return false,
        };

        let child = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to spawn cache bootstrap: {}", e);
                return false;
            }
        };

        match tokio::time::timeout(self.bootstrap_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                warn!(exit_code = output.status.code().unwrap_or(-1), "cache bootstrap exited non-zero");
                false
            }
            Ok(Err(e)) => {
                warn!("cache bootstrap wait failed: {}", e);
                false
            }
            Err(_) => {
                warn!("cache bootstrap timed out");
                false
            }
        }
    }
}

/// Mutual exclusion over the cache root, held for the duration of a
/// bootstrap attempt. Acquired by atomically creating a lock file;
/// released (removed) on drop.
struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    async fn acquire(root: &Path, wait: Duration) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(lock = %path.display(), "removing stale cache lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "timed out waiting for cache lock",
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| mtime.elapsed().map(|age| age > STALE_LOCK_AGE).unwrap_or(false))
        .unwrap_or(false)
}
