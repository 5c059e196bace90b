//! Launchpad public API façade (in-process).
//!
//! Frontends (the CLI, an HTTP layer) depend on [`LaunchpadApi`] only; the
//! [`Orchestrator`] is the in-process implementation.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use launchpad_core::LaunchResult;
use tracing::info;

pub mod orchestrator;
pub mod settings;

pub use launchpad_core::{LaunchError, StreamEvent};
pub use orchestrator::{BuildRequest, HealthCheck, HealthReport, Orchestrator, Resolved, RunEvent, RunHandle};
pub use settings::{BuildBackend, Settings};

/// Build-and-launch API surface.
#[async_trait::async_trait]
pub trait LaunchpadApi: Send + Sync {
    /// Resolve a spec to its immutable ref and derived names. Builds nothing.
    async fn resolve(&self, provider: &str, spec: &str) -> LaunchResult<Resolved>;

    /// Start a build-and-launch run; progress arrives on the handle.
    fn build(&self, request: BuildRequest) -> RunHandle;

    /// Remove finished or stale build pods older than `max_age`.
    async fn cleanup_builds(&self, max_age: Duration) -> LaunchResult<usize>;

    /// Per-service reachability of the registry and the hub.
    async fn health(&self) -> HealthReport;
}

#[async_trait::async_trait]
impl LaunchpadApi for Orchestrator {
    async fn resolve(&self, provider: &str, spec: &str) -> LaunchResult<Resolved> {
        let t0 = Instant::now();
        info!(provider = %provider, spec = %spec, "api: resolve start");
        let resolved = Orchestrator::resolve(self, provider, spec).await?;
        info!(git_ref = %resolved.resolved_ref, took_ms = %t0.elapsed().as_millis(), "api: resolve ok");
        Ok(resolved)
    }

    fn build(&self, request: BuildRequest) -> RunHandle {
        info!(provider = %request.provider, spec = %request.spec, authenticated = request.authenticated, "api: build start");
        self.run(request)
    }

    async fn cleanup_builds(&self, max_age: Duration) -> LaunchResult<usize> {
        let t0 = Instant::now();
        let namespace = &self.settings().build.namespace;
        info!(ns = %namespace, max_age_secs = max_age.as_secs(), "api: cleanup_builds start");
        let removed = self.executor().cleanup_builds(namespace, max_age).await?;
        info!(removed, took_ms = %t0.elapsed().as_millis(), "api: cleanup_builds ok");
        Ok(removed)
    }

    async fn health(&self) -> HealthReport {
        let t0 = Instant::now();
        info!("api: health start");
        let report = Orchestrator::health(self).await;
        info!(healthy = report.ok, took_ms = %t0.elapsed().as_millis(), "api: health ok");
        report
    }
}
