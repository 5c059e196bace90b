//! One build-and-launch run per request.
//!
//! A run resolves the spec, applies admission control, builds the image when
//! the registry does not already have it and starts a server from it. Every
//! step reports to the caller through a bounded queue of [`RunEvent`]s that
//! ends with a terminal `ready` or `failed` event.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use launchpad_admission::{QuotaChecker, RateLimit, RateLimiter, RemoteRateLimiter};
use launchpad_build::{BuildExecutor, BuildJob, KubeBuild, LocalBuild};
use launchpad_core::{names, retry, BuildStatus, LaunchError, LaunchResult, PodPhase, ProgressEvent, StreamEvent};
use launchpad_kubehub::{CancelHandle, ClusterApi, StreamHandle};
use launchpad_launch::{random_server_name, unique_name_from_repo, Launch, LaunchFailure, LaunchInfo, LaunchRequest, Launcher};
use launchpad_registry::{DockerRegistry, ImageRegistry};
use launchpad_repo::{ProviderRegistry, RepoSpec, SpecPolicy};
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::settings::{BuildBackend, Settings};

/// What a caller asks for: `<provider>/<spec>`, e.g. `gh` and `org/repo/main`.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub provider: String,
    pub spec: String,
    /// Rate limit key of the caller, e.g. its address. The repository is used when unset.
    pub client_key: Option<String>,
    /// Verified callers skip the rate limit.
    pub authenticated: bool,
    /// Hub user to launch as. A temporary user is created when unset.
    pub username: Option<String>,
}

impl BuildRequest {
    pub fn new(provider: &str, spec: &str) -> Self { Self { provider: provider.to_string(), spec: spec.to_string(), ..Self::default() } }

    pub fn with_client_key(mut self, key: &str) -> Self {
        self.client_key = Some(key.to_string());
        self
    }

    pub fn authenticated_as(mut self, username: Option<&str>) -> Self {
        self.authenticated = true;
        self.username = username.map(str::to_string);
        self
    }
}

/// Item of a run's event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Event(StreamEvent),
    /// Keep-alive while waiting on a build or a launch.
    Heartbeat,
}

impl RunEvent {
    pub fn as_event(&self) -> Option<&StreamEvent> {
        match self {
            RunEvent::Event(e) => Some(e),
            RunEvent::Heartbeat => None,
        }
    }
}

/// Handle to a running build-and-launch.
///
/// Cancelling (or dropping `rx`) ends the run and its watchers; a build that
/// was already submitted keeps going. [`RunHandle::stop`] also asks the
/// build executor to terminate the build.
pub struct RunHandle {
    pub rx: mpsc::Receiver<RunEvent>,
    pub cancel: CancelHandle,
    stop: CancelHandle,
}

impl RunHandle {
    pub fn stop(&self) { self.stop.cancel(); }
}

/// Attempts per service in [`Orchestrator::health`].
const HEALTH_ATTEMPTS: u32 = 3;

/// Outcome of one service check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub service: String,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
    pub checks: Vec<HealthCheck>,
}

/// Where a spec points to, without building anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolved {
    pub provider: String,
    pub spec: String,
    pub repo_url: String,
    pub resolved_ref: String,
    pub ref_url: Option<String>,
    pub resolved_spec: String,
    pub build_slug: String,
    pub build_name: String,
    pub image_name: String,
}

/// Owns every collaborator of a run. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<Settings>,
    providers: ProviderRegistry,
    policy: SpecPolicy,
    registry: Arc<dyn ImageRegistry>,
    rate_limiter: Option<Arc<dyn RateLimit>>,
    quota: Arc<QuotaChecker>,
    executor: Arc<dyn BuildExecutor>,
    launcher: Arc<dyn Launch>,
}

impl Orchestrator {
    /// Wire up the production collaborators described by `settings`.
    pub fn new(settings: Settings, cluster: Arc<dyn ClusterApi>, providers: ProviderRegistry) -> LaunchResult<Self> {
        let policy = SpecPolicy::new(&settings.banned_specs, &settings.high_quota_specs, &settings.spec_config)?;
        let rate_limiter: Option<Arc<dyn RateLimit>> = match &settings.rate_limit_url {
            Some(url) => Some(Arc::new(RemoteRateLimiter::new(url, settings.rate_limit_token.as_deref().unwrap_or_default(), "request"))),
            None if settings.rate_limit > 0 => {
                Some(Arc::new(RateLimiter::new(settings.rate_limit, settings.rate_limit_period, settings.rate_limit_clean)))
            }
            None => None,
        };
        let executor: Arc<dyn BuildExecutor> = match settings.build_backend {
            BuildBackend::Kubernetes => Arc::new(KubeBuild::new(cluster.clone()).with_queue_cap(settings.event_queue_cap.max(1))),
            BuildBackend::Local => Arc::new(LocalBuild::new()),
        };
        let quota = Arc::new(QuotaChecker::new(cluster, &settings.build.namespace, settings.pod_quota));
        Ok(Self {
            registry: Arc::new(DockerRegistry::new(settings.registry.clone())),
            launcher: Arc::new(Launcher::new(settings.launcher.clone())),
            settings: Arc::new(settings),
            providers,
            policy,
            rate_limiter,
            quota,
            executor,
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn ImageRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<dyn RateLimit>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn BuildExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launch>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    pub fn providers(&self) -> &ProviderRegistry { &self.providers }

    pub fn executor(&self) -> &Arc<dyn BuildExecutor> { &self.executor }

    /// Reachability of the registry (when one is used) and the hub.
    pub async fn health(&self) -> HealthReport {
        let delay = self.settings.health_retry_delay;
        let mut checks = Vec::new();
        if self.settings.use_registry {
            let registry = &self.registry;
            let ok = retry(HEALTH_ATTEMPTS, delay, || async { registry.ping().await.map_err(anyhow::Error::from) })
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "docker registry unreachable");
                    false
                });
            checks.push(HealthCheck { service: "docker-registry".into(), ok });
        }
        let ok = match retry(HEALTH_ATTEMPTS, delay, || self.launcher.ping()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "hub API unhealthy");
                false
            }
        };
        checks.push(HealthCheck { service: "JupyterHub API".into(), ok });
        HealthReport { ok: checks.iter().all(|c| c.ok), checks }
    }

    /// Resolve `spec` with the provider registered under `provider`.
    pub async fn resolve(&self, provider: &str, spec: &str) -> LaunchResult<Resolved> {
        let spec_text = spec.trim_end_matches('/');
        let repo = self.providers.spec(provider, spec_text)?;
        let target = self.target(&repo, spec_text).await?;
        Ok(Resolved {
            provider: provider.to_string(),
            spec: spec_text.to_string(),
            resolved_spec: repo.provider().resolved_spec(&target.git_ref),
            build_slug: target.slug,
            repo_url: target.repo_url,
            resolved_ref: target.git_ref,
            ref_url: target.ref_url,
            build_name: target.build_name,
            image_name: target.image,
        })
    }

    /// Start a run. Events arrive on the returned handle's queue.
    pub fn run(&self, request: BuildRequest) -> RunHandle {
        let (tx, rx) = mpsc::channel(self.settings.event_queue_cap.max(1));
        let cancel = CancelHandle::new();
        let stop = CancelHandle::new();
        let this = self.clone();
        let (run_cancel, run_stop) = (cancel.clone(), stop.clone());
        tokio::spawn(async move {
            let run = Run { orch: &this, tx, cancel: run_cancel.clone(), stop: run_stop };
            let t0 = Instant::now();
            let result = tokio::select! {
                _ = run_cancel.cancelled() => None,
                r = run.execute(&request) => Some(r),
            };
            match result {
                None => info!(provider = %request.provider, spec = %request.spec, "run cancelled"),
                Some(Ok(())) => info!(provider = %request.provider, spec = %request.spec, took_ms = %t0.elapsed().as_millis(), "run finished"),
                Some(Err(_)) if run_cancel.is_cancelled() => debug!(spec = %request.spec, "caller went away"),
                Some(Err(e)) => {
                    warn!(provider = %request.provider, spec = %request.spec, error = %e, "run failed");
                    let _ = run.emit(StreamEvent::failed(e.to_string())).await;
                }
            }
        });
        RunHandle { rx, cancel, stop }
    }

    async fn target<'a>(&self, repo: &'a RepoSpec, spec_text: &'a str) -> LaunchResult<Target<'a>> {
        let repo_url = repo.repo_url();
        let git_ref = repo
            .resolved_ref()
            .await?
            .ok_or_else(|| LaunchError::NotFound(format!("Could not resolve ref for {}. Double check your URL.", repo_url)))?;
        let slug = repo.build_slug()?;
        let repo_config = self.policy.repo_config(spec_text, self.settings.per_repo_quota, self.settings.per_repo_quota_higher);
        Ok(Target {
            spec: repo,
            build_name: names::build_name(&slug, &git_ref),
            image: names::image_name(&self.settings.image_prefix, &slug, &git_ref),
            ref_url: repo.provider().ref_url(&git_ref),
            binder_request: format!("v2/{}/{}", repo.prefix(), spec_text),
            persistent_request: format!("v2/{}/{}", repo.prefix(), repo.provider().resolved_spec(&git_ref)),
            repo_quota: repo_config.quota,
            repo_url,
            git_ref,
            slug,
        })
    }
}

/// Everything derived from a resolved spec.
struct Target<'a> {
    spec: &'a RepoSpec,
    repo_url: String,
    git_ref: String,
    slug: String,
    build_name: String,
    image: String,
    ref_url: Option<String>,
    binder_request: String,
    persistent_request: String,
    repo_quota: Option<u64>,
}

/// Decrements its gauge when dropped.
struct InProgress(&'static str);

impl InProgress {
    fn track(gauge: &'static str) -> Self {
        increment_gauge!(gauge, 1.0);
        Self(gauge)
    }
}

impl Drop for InProgress {
    fn drop(&mut self) { decrement_gauge!(self.0, 1.0); }
}

fn heartbeat(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut iv = interval_at(tokio::time::Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    iv
}

fn record_build(status: &'static str, t0: Instant) {
    histogram!("build_time_seconds", t0.elapsed().as_secs_f64(), "status" => status);
    counter!("build_count", 1, "status" => status);
}

fn ready_event(info: LaunchInfo) -> StreamEvent {
    let message = format!("server running at {}\n", info.url);
    let mut extra = info.extra_args;
    extra.insert("image".into(), Value::String(info.image));
    extra.insert("repo_url".into(), Value::String(info.repo_url));
    StreamEvent { url: Some(info.url), token: Some(info.token), extra, ..StreamEvent::new("ready", message) }
}

struct Run<'a> {
    orch: &'a Orchestrator,
    tx: mpsc::Sender<RunEvent>,
    cancel: CancelHandle,
    stop: CancelHandle,
}

impl Run<'_> {
    async fn send(&self, event: RunEvent) -> LaunchResult<()> {
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
            return Err(LaunchError::Internal("event receiver dropped".into()));
        }
        Ok(())
    }

    async fn emit(&self, event: StreamEvent) -> LaunchResult<()> { self.send(RunEvent::Event(event)).await }

    async fn execute(&self, req: &BuildRequest) -> LaunchResult<()> {
        let orch = self.orch;
        let spec_text = req.spec.trim_end_matches('/');
        let repo = orch.providers.spec(&req.provider, spec_text)?;
        if orch.policy.is_banned(spec_text) {
            warn!(provider = %req.provider, spec = %spec_text, "refusing banned spec");
            return Err(LaunchError::Validation(format!(
                "Sorry, {} has been temporarily disabled from launching. Please contact admins for more info!",
                spec_text
            )));
        }
        let target = orch.target(&repo, spec_text).await?;
        if let (false, Some(limiter)) = (req.authenticated, &orch.rate_limiter) {
            let key = req.client_key.clone().unwrap_or_else(|| format!("{}/{}", repo.prefix(), target.slug));
            let status = limiter.increment(&key).await?;
            debug!(key = %key, remaining = status.remaining, reset_in = status.reset_in, "rate limit ok");
        }
        info!(repo = %target.repo_url, git_ref = %target.git_ref, image = %target.image, "run resolved");

        if orch.settings.use_registry && orch.registry.image_exists(&target.image).await? {
            info!(image = %target.image, "found built image");
            self.emit(StreamEvent::built(&target.image, true)).await?;
            return self.launch(&target, req).await;
        }
        orch.quota.check_repo_quota(&target.image, target.repo_quota, &target.repo_url).await?;
        self.build(&target).await?;
        self.emit(StreamEvent::built(&target.image, false)).await?;
        self.launch(&target, req).await
    }

    fn render_appendix(&self, template: &str, t: &Target<'_>) -> String {
        let host = &self.orch.settings.launch_host;
        template
            .replace("{binder_url}", &format!("{}{}", host, t.binder_request))
            .replace("{persistent_binder_url}", &format!("{}{}", host, t.persistent_request))
            .replace("{repo_url}", &t.repo_url)
            .replace("{ref_url}", t.ref_url.as_deref().unwrap_or_default())
    }

    async fn build(&self, t: &Target<'_>) -> LaunchResult<()> {
        let mut opts = self.orch.settings.build.clone();
        opts.appendix = opts.appendix.map(|a| self.render_appendix(&a, t));
        let job = BuildJob::new(&t.build_name, &t.repo_url, &t.git_ref, &t.image, opts).with_git_credentials(t.spec.provider().git_credentials());
        self.emit(StreamEvent::waiting()).await?;
        let _inprogress = InProgress::track("builds_inprogress");
        let t0 = Instant::now();
        info!(build = %t.build_name, image = %t.image, "submitting build");
        let handle = self.orch.executor.submit(job, self.stop.clone()).await?;
        self.relay_build(handle, &t.build_name, t0).await
    }

    /// Forward build progress until a terminal status.
    async fn relay_build(&self, mut handle: StreamHandle<ProgressEvent>, build_name: &str, t0: Instant) -> LaunchResult<()> {
        let mut beat = heartbeat(self.orch.settings.heartbeat_interval);
        let mut failed = false;
        loop {
            let progress = tokio::select! {
                p = handle.rx.recv() => p,
                _ = beat.tick() => {
                    self.send(RunEvent::Heartbeat).await?;
                    continue;
                }
            };
            match progress {
                Some(ProgressEvent::LogMessage(line)) => {
                    failed |= line.is_failure();
                    self.emit(StreamEvent::from_log(line)).await?
                }
                Some(ProgressEvent::PodPhaseChange(PodPhase::Pending | PodPhase::Running | PodPhase::Succeeded | PodPhase::Deleted)) => {}
                Some(ProgressEvent::PodPhaseChange(phase)) => {
                    self.emit(StreamEvent { message: None, ..StreamEvent::new(phase.as_str(), "") }).await?;
                }
                Some(ProgressEvent::BuildStatusChange(status)) => match status {
                    BuildStatus::Completed if failed => {
                        warn!(build = %build_name, "build reported failure in its log");
                        record_build("failure", t0);
                        return Err(LaunchError::BuildFailed(build_name.to_string()));
                    }
                    BuildStatus::Completed => {
                        info!(build = %build_name, took_ms = %t0.elapsed().as_millis(), "build completed");
                        record_build("success", t0);
                        return Ok(());
                    }
                    BuildStatus::Failed => {
                        warn!(build = %build_name, "build failed");
                        record_build("failure", t0);
                        return Err(LaunchError::BuildFailed(build_name.to_string()));
                    }
                    BuildStatus::Terminated => return Err(LaunchError::ProcessTerminated),
                    other => debug!(build = %build_name, status = ?other, "build status"),
                },
                None if self.stop.is_cancelled() => return Err(LaunchError::ProcessTerminated),
                None => {
                    record_build("failure", t0);
                    return Err(LaunchError::BuildFailed(format!("{}: progress stream ended early", build_name)));
                }
            }
        }
    }

    /// Await `fut`, sending heartbeats while it runs.
    async fn with_heartbeats<F: Future>(&self, fut: F) -> LaunchResult<F::Output> {
        tokio::pin!(fut);
        let mut beat = heartbeat(self.orch.settings.heartbeat_interval);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = beat.tick() => self.send(RunEvent::Heartbeat).await?,
            }
        }
    }

    fn launch_args(&self, t: &Target<'_>) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("binder_ref_url".into(), t.ref_url.clone().map(Value::String).unwrap_or(Value::Null));
        args.insert("binder_launch_host".into(), Value::String(self.orch.settings.launch_host.clone()));
        args.insert("binder_request".into(), Value::String(t.binder_request.clone()));
        args.insert("binder_persistent_request".into(), Value::String(t.persistent_request.clone()));
        args
    }

    async fn launch(&self, t: &Target<'_>, req: &BuildRequest) -> LaunchResult<()> {
        let settings = &self.orch.settings;
        if let Some(snapshot) = self.orch.quota.check_repo_quota(&t.image, t.repo_quota, &t.repo_url).await? {
            match snapshot.quota {
                Some(q) if snapshot.matching * 2 >= q => {
                    warn!(repo = %t.repo_url, matching = snapshot.matching, total = snapshot.total, "launching, repo close to its quota")
                }
                _ => info!(repo = %t.repo_url, matching = snapshot.matching, total = snapshot.total, "launching"),
            }
        }
        self.emit(StreamEvent::launching("Launching server...\n")).await?;

        let _inprogress = InProgress::track("launches_inprogress");
        let attempts = settings.launch_retries.max(1);
        let mut delay = settings.launch_retry_delay;
        let mut attempt = 0;
        loop {
            let (username, server_name) = match &req.username {
                Some(user) if settings.launcher.allow_named_servers => (user.clone(), random_server_name()),
                Some(user) => (user.clone(), String::new()),
                None => (unique_name_from_repo(&t.repo_url), String::new()),
            };
            let request = LaunchRequest::new(&t.image, &username, &t.repo_url).with_server_name(&server_name).with_extra_args(self.launch_args(t));
            let t0 = Instant::now();
            let err = match self.with_heartbeats(self.orch.launcher.launch(&request)).await? {
                Ok(info) => {
                    histogram!("launch_time_seconds", t0.elapsed().as_secs_f64(), "status" => "success", "retries" => attempt.to_string());
                    counter!("launch_count", 1, "status" => "success");
                    info!(user = %username, image = %t.image, attempt, "server ready");
                    return self.emit(ready_event(info)).await;
                }
                Err(e) => e,
            };
            attempt += 1;
            // The hub answers these the same way every time.
            let fatal = matches!(err, LaunchFailure::ServerExists { .. } | LaunchFailure::NamedServerLimit { .. });
            let status = if fatal || attempt >= attempts { "failure" } else { "retry" };
            histogram!("launch_time_seconds", t0.elapsed().as_secs_f64(), "status" => status, "retries" => "-1");
            if status == "failure" {
                counter!("launch_count", 1, "status" => "failure");
                error!(user = %username, image = %t.image, attempt, error = %err, "launch failed");
                return Err(err.into());
            }
            error!(attempt, error = %err, "retrying launch after error");
            self.emit(StreamEvent::launching(format!("Launch attempt {} failed, retrying...\n", attempt))).await?;
            self.with_heartbeats(tokio::time::sleep(delay)).await?;
            delay *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_event_carries_server_and_launch_args() {
        let mut extra = Map::new();
        extra.insert("binder_request".into(), Value::String("v2/gh/org/repo/main".into()));
        let ev = ready_event(LaunchInfo {
            url: "http://hub/user/u/".into(),
            token: "tok".into(),
            image: "reg/img:1".into(),
            repo_url: "https://github.com/org/repo".into(),
            extra_args: extra,
        });
        assert_eq!(ev.phase, "ready");
        assert_eq!(ev.message.as_deref(), Some("server running at http://hub/user/u/\n"));
        assert_eq!(ev.token.as_deref(), Some("tok"));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["url"], "http://hub/user/u/");
        assert_eq!(json["image"], "reg/img:1");
        assert_eq!(json["binder_request"], "v2/gh/org/repo/main");
    }

    #[test]
    fn requests_default_to_anonymous() {
        let req = BuildRequest::new("gh", "org/repo/main").with_client_key("10.0.0.1");
        assert!(!req.authenticated);
        assert_eq!(req.client_key.as_deref(), Some("10.0.0.1"));
        let req = req.authenticated_as(Some("me"));
        assert!(req.authenticated);
        assert_eq!(req.username.as_deref(), Some("me"));
    }

    #[tokio::test]
    async fn heartbeat_waits_a_full_period_first() {
        let mut beat = heartbeat(Duration::from_millis(50));
        let t0 = tokio::time::Instant::now();
        beat.tick().await;
        assert!(t0.elapsed() >= Duration::from_millis(45));
    }
}
