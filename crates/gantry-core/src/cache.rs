//! Cache freshness state consulted before the scan stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::CacheConfig;

/// Verdict of the cache gate for one pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheReadiness {
    /// Marker present and fresh, or bootstrap succeeded: full scan mode.
    Ready,

    /// Marker present but stale and bootstrap failed: scan without update.
    Degraded,

    /// Marker absent and bootstrap failed: no usable cache.
    Unavailable,
}

/// Mutable cache-gate state for one run. Only the gate writes it; the
/// scan stage reads `readiness` afterward to pick its execution mode.
#[derive(Debug, Clone)]
pub struct CacheState {
    pub root: PathBuf,
    pub marker: PathBuf,
    pub staleness: Duration,
    pub last_checked: Option<DateTime<Utc>>,
    pub readiness: Option<CacheReadiness>,
}

/// Result of evaluating the freshness predicate at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Fresh,
    Stale,
    Absent,
}

impl CacheState {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            root: config.root.clone(),
            marker: config.root.join(&config.marker),
            staleness: Duration::from_secs(config.staleness_secs),
            last_checked: None,
            readiness: None,
        }
    }

    /// Freshness predicate: the marker file exists and its mtime is
    /// within the staleness window.
    pub fn marker_state(&self) -> MarkerState {
        let metadata = match std::fs::metadata(&self.marker) {
            Ok(m) => m,
            Err(_) => return MarkerState::Absent,
        };
        let modified = match metadata.modified() {
            Ok(t) => t,
            // Filesystem without mtime support: treat as stale so a
            // bootstrap is attempted rather than trusting the cache.
            Err(_) => return MarkerState::Stale,
        };
        match modified.elapsed() {
            Ok(age) if age <= self.staleness => MarkerState::Fresh,
            Ok(_) => MarkerState::Stale,
            // mtime in the future: clock skew, treat as fresh.
            Err(_) => MarkerState::Fresh,
        }
    }
}
