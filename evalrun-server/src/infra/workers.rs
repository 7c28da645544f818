//! Probe and summary executors backed by external worker processes.
//!
//! Each job spawns the configured command, writes the job as JSON on stdin,
//! and reads one JSON result from stdout:
//! `{ "success": bool, "error": { "message", "code", "retryable" } }`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use evalrun_core::orchestration::{ProbeExecutor, SummaryExecutor};
use evalrun_core::types::{ProbeJob, SummarizeJob, UpstreamError, UpstreamErrorCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::config::CommandSpec;

const STDERR_PREVIEW_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    success: bool,
    #[serde(default)]
    error: Option<WorkerFailure>,
}

#[derive(Debug, Deserialize)]
struct WorkerFailure {
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
}

impl From<WorkerFailure> for UpstreamError {
    fn from(failure: WorkerFailure) -> Self {
        let mut err = match failure.code.as_deref() {
            Some(code) => {
                let code = serde_json::from_value(serde_json::Value::String(code.to_string()))
                    .unwrap_or(UpstreamErrorCode::Unknown);
                UpstreamError::new(code, failure.message)
            }
            None => UpstreamError::classify_message(failure.message),
        };
        err.retryable = failure.retryable;
        err
    }
}

/// Interprets a worker's stdout. The last non-empty line carries the result
/// so workers may print progress before it.
pub fn parse_worker_output(stdout: &str) -> Result<(), UpstreamError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| {
            UpstreamError::new(UpstreamErrorCode::InvalidResponse, "worker produced no output")
        })?;

    let response: WorkerResponse = serde_json::from_str(line).map_err(|err| {
        UpstreamError::new(
            UpstreamErrorCode::InvalidResponse,
            format!("worker output is not a result object: {err}"),
        )
    })?;

    if response.success {
        return Ok(());
    }
    Err(response
        .error
        .map(UpstreamError::from)
        .unwrap_or_else(|| {
            UpstreamError::new(UpstreamErrorCode::Unknown, "worker reported failure without details")
        }))
}

fn preview(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Debug, Clone)]
pub struct WorkerProcess {
    command: CommandSpec,
    timeout: Duration,
}

impl WorkerProcess {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub async fn invoke<T: Serialize + Sync>(&self, job: &T) -> Result<(), UpstreamError> {
        let request = serde_json::to_vec(job).map_err(|err| {
            UpstreamError::new(
                UpstreamErrorCode::ValidationError,
                format!("failed to encode job: {err}"),
            )
        })?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                UpstreamError::new(
                    UpstreamErrorCode::Unknown,
                    format!("failed to spawn worker {}: {err}", self.command.program),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(&request).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(err) = written {
                return Err(UpstreamError::new(
                    UpstreamErrorCode::Unknown,
                    format!("failed to write job to worker: {err}"),
                ));
            }
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(UpstreamError::new(
                    UpstreamErrorCode::Unknown,
                    format!("failed to collect worker output: {err}"),
                ));
            }
            Err(_) => {
                return Err(UpstreamError::new(
                    UpstreamErrorCode::Timeout,
                    format!("worker timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_worker_output(&stdout) {
            Err(err) if err.code == UpstreamErrorCode::InvalidResponse && !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::debug!(
                    program = %self.command.program,
                    status = %output.status,
                    "worker exited without a result"
                );
                Err(UpstreamError::classify_message(format!(
                    "worker exited with {}: {}",
                    output.status,
                    preview(stderr.trim(), STDERR_PREVIEW_CHARS)
                )))
            }
            result => result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessProbeExecutor {
    process: WorkerProcess,
}

impl ProcessProbeExecutor {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self {
            process: WorkerProcess::new(command, timeout),
        }
    }
}

#[async_trait]
impl ProbeExecutor for ProcessProbeExecutor {
    async fn execute(&self, job: &ProbeJob) -> Result<(), UpstreamError> {
        self.process.invoke(job).await
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSummaryExecutor {
    process: WorkerProcess,
}

impl ProcessSummaryExecutor {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self {
            process: WorkerProcess::new(command, timeout),
        }
    }
}

#[async_trait]
impl SummaryExecutor for ProcessSummaryExecutor {
    async fn summarize(&self, job: &SummarizeJob) -> Result<(), UpstreamError> {
        self.process.invoke(job).await
    }
}
