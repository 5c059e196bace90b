//! Builds as a local builder process.

use std::process::Stdio;

use anyhow::{Context, Result};
use launchpad_core::{BuildStatus, LogLine, ProgressEvent};
use launchpad_kubehub::{pump_bytes_to_lines, CancelHandle, StreamHandle};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::{BuildExecutor, BuildJob};

/// Runs the builder as a child process. Cancelling the run kills the process
/// and reports [`BuildStatus::Terminated`].
pub struct LocalBuild {
    program: String,
    pre_args: Vec<String>,
    queue_cap: usize,
}

impl Default for LocalBuild {
    fn default() -> Self { Self::new() }
}

impl LocalBuild {
    pub fn new() -> Self {
        let queue_cap = std::env::var("LAUNCHPAD_EVENT_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(256);
        Self { program: crate::BUILDER_COMMAND.to_string(), pre_args: Vec::new(), queue_cap }
    }

    /// Run `program pre_args.. <builder args> <repo url>` instead of the builder.
    pub fn with_command(mut self, program: &str, pre_args: &[&str]) -> Self {
        self.program = program.to_string();
        self.pre_args = pre_args.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait::async_trait]
impl BuildExecutor for LocalBuild {
    async fn submit(&self, job: BuildJob, cancel: CancelHandle) -> Result<StreamHandle<ProgressEvent>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.pre_args).args(job.builder_args()).arg(&job.repo_url);
        if let Some(c) = &job.git_credentials {
            cmd.env("GIT_CREDENTIAL_ENV", c);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        info!(build = %job.name, program = %self.program, "starting local build");
        let mut child = cmd.spawn().with_context(|| format!("spawning {}", self.program))?;

        let (tx, rx) = mpsc::channel(self.queue_cap);
        let stdout = child.stdout.take().context("builder stdout not captured")?;
        let stderr = child.stderr.take().context("builder stderr not captured")?;
        let pumps = cancel.child();
        let name = job.name.clone();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tx.send(ProgressEvent::BuildStatusChange(BuildStatus::Running)).await;
            let parse = |l: String| ProgressEvent::LogMessage(LogLine::parse(&l));
            let out = tokio::spawn(pump_bytes_to_lines(ReaderStream::new(stdout), tx.clone(), pumps.clone(), "local-build-stdout", parse));
            let err = tokio::spawn(pump_bytes_to_lines(ReaderStream::new(stderr), tx.clone(), pumps.clone(), "local-build-stderr", parse));
            let exit = tokio::select! {
                _ = run_cancel.cancelled() => None,
                exit = child.wait() => Some(exit),
            };
            let status = match exit {
                None => {
                    warn!(build = %name, "terminating local build");
                    if let Err(e) = child.kill().await {
                        error!(build = %name, error = %e, "failed to kill builder");
                    }
                    BuildStatus::Terminated
                }
                Some(Ok(s)) if s.success() => BuildStatus::Completed,
                Some(Ok(s)) => {
                    warn!(build = %name, code = ?s.code(), "builder exited with failure");
                    BuildStatus::Failed
                }
                Some(Err(e)) => {
                    error!(build = %name, error = %e, "waiting for builder");
                    BuildStatus::Failed
                }
            };
            if status == BuildStatus::Terminated {
                pumps.cancel();
            }
            let _ = out.await;
            let _ = err.await;
            info!(build = %name, status = ?status, "local build finished");
            let _ = tx.send(ProgressEvent::BuildStatusChange(status)).await;
        });
        Ok(StreamHandle { rx, cancel })
    }
}
