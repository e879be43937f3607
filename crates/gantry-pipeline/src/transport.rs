//! Command transport abstraction over the remote shell session.
//!
//! `SshTransport` shells out to the system `ssh` binary with a fresh
//! authenticated session per invocation; implicit session reuse is
//! avoided deliberately so a stale connection from an earlier stage can
//! never poison a later one. Tests use `fakes::ScriptedTransport`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use gantry_core::RemoteTarget;

/// Output of a command that ran to completion on the remote side.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Classified outcome of one transport invocation.
///
/// The distinction matters for retry policy: a command that reached the
/// remote host may have had non-idempotent side effects and is never
/// retried; a connection that was refused cannot have had any.
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    /// Session established, remote command exited (possibly non-zero).
    Completed(RemoteOutput),

    /// Credential rejected by the remote host.
    AuthFailure(String),

    /// Connection refused, reset, or timed out before a session existed.
    NetworkFailure(String),
}

/// Seam between the pipeline and the secured shell session.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> TransportOutcome;
}

/// Transport backed by the system `ssh` binary.
#[derive(Default)]
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        SshTransport
    }

    fn build_args(target: &RemoteTarget, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &target.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.display().to_string());
        }

        if target.port != 22 {
            args.push("-p".to_string());
            args.push(target.port.to_string());
        }

        // BatchMode prevents interactive prompts from hanging the
        // pipeline; keepalives detect stalled connections.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", target.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", target.user, target.host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl CommandTransport for SshTransport {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> TransportOutcome {
        let args = Self::build_args(target, command);
        debug!(host = %target.host, "opening ssh session");

        let output = match Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(out) => out,
            Err(e) => {
                return TransportOutcome::NetworkFailure(format!("failed to spawn ssh: {}", e))
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr_text = String::from_utf8_lossy(&output.stderr).to_string();

        if is_auth_error(&stderr_text) {
            return TransportOutcome::AuthFailure(last_line(&stderr_text));
        }

        // ssh exit 255 means the transport failed, not the remote command.
        if exit_code == 255 || is_transient_error(&stderr_text) {
            return TransportOutcome::NetworkFailure(last_line(&stderr_text));
        }

        TransportOutcome::Completed(RemoteOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn last_line(text: &str) -> String {
    text.lines().last().unwrap_or("").trim().to_string()
}

/// Credential rejections. Never retried.
fn is_auth_error(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    let auth_patterns = [
        "permission denied",
        "authentication failed",
        "too many authentication failures",
        "no supported authentication methods",
        "host key verification failed",
    ];
    auth_patterns.iter().any(|p| stderr.contains(p))
}

/// Transient connection errors worth one retry.
fn is_transient_error(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];
    transient_patterns.iter().any(|p| stderr.contains(p))
}

/// Test doubles for the transport seam.
pub mod fakes {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that replays a scripted sequence of outcomes and
    /// records every command it was asked to run. Once the script is
    /// exhausted, commands succeed with `default_stdout`.
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<TransportOutcome>>,
        calls: Mutex<Vec<String>>,
        default_stdout: Vec<u8>,
    }

    impl ScriptedTransport {
        pub fn new(outcomes: Vec<TransportOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
                default_stdout: Vec::new(),
            }
        }

        /// Transport where every command succeeds with the given stdout.
        pub fn always_ok(stdout: &str) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                default_stdout: stdout.as_bytes().to_vec(),
            }
        }

        /// Commands observed so far, in order.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl CommandTransport for ScriptedTransport {
        async fn exec(&self, _target: &RemoteTarget, command: &str) -> TransportOutcome {
            self.calls
                .lock()
                .expect("calls lock")
                .push(command.to_string());
            match self.script.lock().expect("script lock").pop_front() {
                Some(outcome) => outcome,
                None => TransportOutcome::Completed(RemoteOutput {
                    exit_code: 0,
                    stdout: self.default_stdout.clone(),
                    stderr: Vec::new(),
                }),
            }
        }
    }
}
