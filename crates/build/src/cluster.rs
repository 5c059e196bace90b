//! Builds as pods on a cluster.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use launchpad_core::{BuildState, BuildStatus, LogLine, PodPhase, ProgressEvent};
use launchpad_kubehub::{
    pump_bytes_to_lines, CancelHandle, ClusterApi, CreateOutcome, DeleteOutcome, PodEvent, PodSummary, StreamHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{BuildExecutor, BuildJob, BUILD_COMPONENT_LABEL};

/// Docker-in-docker daemons that sticky builds can be pinned next to.
pub const DIND_POD_SELECTOR: &str = "component=dind,app=binder";

/// How long a finished build waits for its log follow to drain.
const LOG_DRAIN: Duration = Duration::from_secs(5);

/// Runs builds as pods. Cancelling, or dropping the receiver, stops the watch
/// and log follow; the pod itself runs on and is cleaned up by whoever sees it finish.
pub struct KubeBuild {
    cluster: Arc<dyn ClusterApi>,
    queue_cap: usize,
    watch_retries: u32,
    retry_delay: Duration,
}

impl KubeBuild {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        let queue_cap = std::env::var("LAUNCHPAD_EVENT_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(256);
        let watch_retries = std::env::var("LAUNCHPAD_WATCH_RETRIES").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        Self { cluster, queue_cap, watch_retries, retry_delay: Duration::from_secs(1) }
    }

    pub fn with_watch_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.watch_retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }

    async fn dind_nodes(&self, namespace: &str) -> Result<Vec<String>> {
        let pods = self.cluster.list_pods(namespace, DIND_POD_SELECTOR).await?;
        Ok(pods.iter().filter_map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone())).collect())
    }
}

#[async_trait::async_trait]
impl BuildExecutor for KubeBuild {
    async fn submit(&self, job: BuildJob, cancel: CancelHandle) -> Result<StreamHandle<ProgressEvent>> {
        let nodes = if job.opts.sticky_builds { self.dind_nodes(job.namespace()).await? } else { Vec::new() };
        let pod = job.pod_manifest(&nodes)?;
        let joined = match self.cluster.create_pod(job.namespace(), &pod).await? {
            CreateOutcome::Created => {
                info!(build = %job.name, repo = %job.repo_url, "started build");
                false
            }
            CreateOutcome::AlreadyExists => {
                info!(build = %job.name, "build already running");
                true
            }
        };
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let watch = Watch {
            cluster: self.cluster.clone(),
            tail_lines: joined.then_some(job.opts.log_tail_lines),
            job,
            tx,
            cancel: cancel.clone(),
            retries: self.watch_retries,
            retry_delay: self.retry_delay,
            state: BuildState::default(),
            logs: None,
        };
        tokio::spawn(watch.run());
        Ok(StreamHandle { rx, cancel })
    }

    async fn cleanup_builds(&self, namespace: &str, max_age: Duration) -> Result<usize> {
        cleanup_builds(self.cluster.as_ref(), namespace, max_age).await
    }
}

/// What to do after one watch event.
enum Step {
    Continue,
    Done,
}

/// Owns the phase watch of one build and the log follow it starts.
struct Watch {
    cluster: Arc<dyn ClusterApi>,
    job: BuildJob,
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancelHandle,
    tail_lines: Option<i64>,
    retries: u32,
    retry_delay: Duration,
    state: BuildState,
    logs: Option<(CancelHandle, JoinHandle<()>)>,
}

impl Watch {
    async fn run(mut self) {
        info!(build = %self.job.name, "watching build pod");
        let mut attempt = 0u32;
        loop {
            match self.watch_once().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(build = %self.job.name, error = %format!("{:#}", e), "build watch interrupted"),
            }
            if self.cancel.is_cancelled() || self.tx.is_closed() {
                info!(build = %self.job.name, "stopping watch");
                break;
            }
            attempt += 1;
            if attempt > self.retries {
                error!(build = %self.job.name, attempts = attempt, "giving up on build watch");
                let line = LogLine::parse(r#"{"phase":"failure","message":"Lost track of the build pod\n"}"#);
                self.finish(BuildStatus::Failed, Some(line)).await;
                break;
            }
            debug!(build = %self.job.name, attempt, "reconnecting build watch");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        self.stop_logs();
    }

    /// One watch connection. `Ok(true)` once the build is over or we were
    /// cancelled; `Ok(false)` when the stream ended early.
    async fn watch_once(&mut self) -> Result<bool> {
        let mut events = self.cluster.watch_pods(self.job.namespace(), &self.job.selector()).await?;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(true),
                _ = self.tx.closed() => {
                    debug!(build = %self.job.name, "progress receiver dropped");
                    return Ok(true);
                }
                next = events.next() => next,
            };
            let Some(event) = next else { return Ok(false) };
            let step = match event? {
                PodEvent::Applied(pod) if pod.name == self.job.name => self.on_phase(pod.phase).await?,
                PodEvent::Applied(_) => Step::Continue,
                PodEvent::Deleted(pod) if pod.name == self.job.name => self.on_deleted().await,
                PodEvent::Deleted(_) => Step::Continue,
                PodEvent::Restarted(pods) => match pods.into_iter().find(|p| p.name == self.job.name) {
                    Some(PodSummary { phase, .. }) => self.on_phase(phase).await?,
                    // Gone before we looked: someone else saw it finish and cleaned up.
                    None => self.on_deleted().await,
                },
            };
            if let Step::Done = step {
                return Ok(true);
            }
        }
    }

    async fn emit(&self, event: ProgressEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            r = self.tx.send(event) => r.is_ok(),
        }
    }

    async fn on_phase(&mut self, phase: PodPhase) -> Result<Step> {
        if phase == PodPhase::Unknown {
            self.emit(ProgressEvent::BuildStatusChange(BuildStatus::Unknown)).await;
            return Ok(Step::Continue);
        }
        if !self.state.observe(phase) {
            return Ok(Step::Continue);
        }
        debug!(build = %self.job.name, phase = %phase.as_str(), "build phase");
        self.emit(ProgressEvent::PodPhaseChange(phase)).await;
        match phase {
            PodPhase::Pending => {
                self.emit(ProgressEvent::BuildStatusChange(BuildStatus::Pending)).await;
                Ok(Step::Continue)
            }
            PodPhase::Running => {
                self.start_logs();
                self.emit(ProgressEvent::BuildStatusChange(BuildStatus::Running)).await;
                Ok(Step::Continue)
            }
            PodPhase::Succeeded => {
                self.start_logs();
                self.drain_logs().await;
                // Completed is reported once the pod is gone.
                match self.cleanup().await? {
                    DeleteOutcome::Deleted => Ok(Step::Continue),
                    DeleteOutcome::NotFound => Ok(self.on_deleted().await),
                }
            }
            PodPhase::Failed => {
                self.start_logs();
                self.drain_logs().await;
                self.cleanup().await?;
                self.finish(BuildStatus::Failed, None).await;
                Ok(Step::Done)
            }
            PodPhase::Deleted => Ok(self.on_deleted().await),
            PodPhase::Unknown => Ok(Step::Continue),
        }
    }

    async fn on_deleted(&mut self) -> Step {
        if self.state == BuildState::Failed {
            return Step::Done;
        }
        self.state.observe(PodPhase::Deleted);
        self.drain_logs().await;
        self.finish(BuildStatus::Completed, None).await;
        Step::Done
    }

    async fn finish(&mut self, status: BuildStatus, line: Option<LogLine>) {
        if let Some(line) = line {
            self.emit(ProgressEvent::LogMessage(line)).await;
        }
        info!(build = %self.job.name, status = ?status, "build finished");
        self.emit(ProgressEvent::BuildStatusChange(status)).await;
    }

    async fn cleanup(&self) -> Result<DeleteOutcome> {
        let outcome = self.cluster.delete_pod(self.job.namespace(), &self.job.name).await?;
        if outcome == DeleteOutcome::NotFound {
            debug!(build = %self.job.name, "build pod already deleted");
        }
        Ok(outcome)
    }

    fn start_logs(&mut self) {
        if self.logs.is_some() {
            return;
        }
        let cancel = self.cancel.child();
        let cluster = self.cluster.clone();
        let (ns, name, tail) = (self.job.namespace().to_string(), self.job.name.clone(), self.tail_lines);
        let tx = self.tx.clone();
        let pump_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            info!(build = %name, tail = ?tail, "following build logs");
            match cluster.log_stream(&ns, &name, tail).await {
                Ok(stream) => {
                    pump_bytes_to_lines(stream, tx, pump_cancel, &name, |l| ProgressEvent::LogMessage(LogLine::parse(&l))).await
                }
                Err(e) => warn!(build = %name, error = %format!("{:#}", e), "could not follow build logs"),
            }
        });
        self.logs = Some((cancel, task));
    }

    /// Let the log follow reach the end of the pod's output, within bounds.
    async fn drain_logs(&mut self) {
        if let Some((cancel, task)) = self.logs.take() {
            if tokio::time::timeout(LOG_DRAIN, task).await.is_err() {
                debug!(build = %self.job.name, "log follow did not drain in time");
                cancel.cancel();
            }
        }
    }

    fn stop_logs(&mut self) {
        if let Some((cancel, _)) = self.logs.take() {
            cancel.cancel();
        }
    }
}

/// Delete build pods that finished (`Succeeded`, `Failed`, `Evicted`) or have
/// been running longer than `max_age`. A zero `max_age` disables the age check.
pub async fn cleanup_builds(cluster: &dyn ClusterApi, namespace: &str, max_age: Duration) -> Result<usize> {
    let selector = format!("component={}", BUILD_COMPONENT_LABEL);
    let builds = cluster.list_pods(namespace, &selector).await?;
    let cutoff = Utc::now() - chrono::Duration::from_std(max_age).context("max age out of range")?;
    let mut deleted = 0usize;
    let mut phases = std::collections::BTreeMap::<String, usize>::new();
    for pod in &builds {
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.clone()).unwrap_or_default();
        let reason = status.and_then(|s| s.reason.clone()).unwrap_or_default();
        *phases.entry(phase.clone()).or_default() += 1;
        let name = pod.metadata.name.clone().unwrap_or_default();
        let repo = pod.metadata.annotations.as_ref().and_then(|a| a.get("binder-repo").cloned()).unwrap_or_else(|| "unknown".into());
        let finished = matches!(phase.as_str(), "Succeeded" | "Failed" | "Evicted") || reason == "Evicted";
        let started = status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);
        let stale = !max_age.is_zero() && started.is_some_and(|t| t < cutoff);
        if finished {
            info!(build = %name, phase = %phase, repo = %repo, "deleting finished build");
        } else if stale {
            info!(build = %name, repo = %repo, "deleting long-running build");
        } else {
            continue;
        }
        cluster.delete_pod(namespace, &name).await?;
        deleted += 1;
    }
    if deleted > 0 {
        info!(deleted, total = builds.len(), "deleted build pods");
    }
    debug!(phases = ?phases, "build phase summary");
    Ok(deleted)
}
