//! Terminal-state notification hooks.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use gantry_core::PipelineRun;

/// Receives the finalized run exactly once per pipeline execution.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, run: &PipelineRun);
}

/// No-op notifier for pipelines without a configured channel.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _run: &PipelineRun) {}
}

/// Fire-and-forget webhook: posts `{status, run_id}` plus the summary.
/// Delivery failure is logged and swallowed — notification must never
/// change the outcome of a finished run.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, run: &PipelineRun) {
        let payload = json!({
            "status": run.state.to_string(),
            "run_id": run.id.to_string(),
            "summary": run.summary(),
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(run_id = %run.id, "notification delivered");
            }
            Ok(response) => {
                warn!(run_id = %run.id, status = %response.status(), "notification endpoint rejected payload");
            }
            Err(e) => {
                warn!(run_id = %run.id, "notification delivery failed: {}", e);
            }
        }
    }
}

/// Test doubles for the notification seam.
pub mod fakes {
    use super::*;
    use gantry_core::RunState;
    use std::sync::Mutex;

    /// Notifier that records every terminal state it was handed.
    #[derive(Default)]
    pub struct RecordingNotifier {
        seen: Mutex<Vec<(String, RunState)>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn notifications(&self) -> Vec<(String, RunState)> {
            self.seen.lock().expect("seen lock").clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, run: &PipelineRun) {
            self.seen
                .lock()
                .expect("seen lock")
                .push((run.id.to_string(), run.state));
        }
    }
}
