//! Deployment settings, read once at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use launchpad_admission::{DEFAULT_CLEAN_SECONDS, DEFAULT_LIMIT, DEFAULT_PERIOD_SECONDS};
use launchpad_build::BuildOptions;
use launchpad_launch::LauncherConfig;
use launchpad_registry::RegistryConfig;
use launchpad_repo::{parse_spec_config, SpecConfigRule};

/// Where builds run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildBackend {
    Kubernetes,
    Local,
}

impl std::str::FromStr for BuildBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(BuildBackend::Kubernetes),
            "local" => Ok(BuildBackend::Local),
            other => anyhow::bail!("unknown build backend {:?} (expected kubernetes or local)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Prepended to every image name, e.g. `registry.example/binder-`.
    pub image_prefix: String,
    /// Check the registry for an existing image before building.
    pub use_registry: bool,
    /// Public base URL of this service, passed to launched servers and
    /// substituted into the build appendix.
    pub launch_host: String,
    pub build: BuildOptions,
    pub build_backend: BuildBackend,
    pub per_repo_quota: Option<u64>,
    pub per_repo_quota_higher: Option<u64>,
    /// Session pods allowed across all repositories.
    pub pod_quota: Option<u64>,
    pub banned_specs: Vec<String>,
    pub high_quota_specs: Vec<String>,
    pub spec_config: Vec<SpecConfigRule>,
    pub rate_limit: i64,
    pub rate_limit_period: i64,
    pub rate_limit_clean: i64,
    /// Shared rate limit endpoint; limits are counted in-process when unset.
    pub rate_limit_url: Option<String>,
    pub rate_limit_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub event_queue_cap: usize,
    pub launch_retries: u32,
    pub launch_retry_delay: Duration,
    /// Pause between attempts of a health check.
    pub health_retry_delay: Duration,
    pub launcher: LauncherConfig,
    pub registry: RegistryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_prefix: String::new(),
            use_registry: true,
            launch_host: String::new(),
            build: BuildOptions::default(),
            build_backend: BuildBackend::Kubernetes,
            per_repo_quota: None,
            per_repo_quota_higher: None,
            pod_quota: None,
            banned_specs: Vec::new(),
            high_quota_specs: Vec::new(),
            spec_config: Vec::new(),
            rate_limit: DEFAULT_LIMIT,
            rate_limit_period: DEFAULT_PERIOD_SECONDS,
            rate_limit_clean: DEFAULT_CLEAN_SECONDS,
            rate_limit_url: None,
            rate_limit_token: None,
            heartbeat_interval: Duration::from_secs(15),
            event_queue_cap: 256,
            launch_retries: 3,
            launch_retry_delay: Duration::from_secs(4),
            health_retry_delay: Duration::from_secs(1),
            launcher: LauncherConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// `;`-separated list, blanks dropped.
fn split_list(raw: &str) -> Vec<String> { raw.split(';').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect() }

impl Settings {
    /// Read `LAUNCHPAD_*` variables over the defaults. Malformed numbers fall
    /// back to the default; malformed JSON settings are an error.
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        let flag = |k: &str, default: bool| var(k).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(default);
        let d = Self::default();
        let db = BuildOptions::default();

        let node_selector: BTreeMap<String, String> = match var("LAUNCHPAD_BUILD_NODE_SELECTOR") {
            Some(raw) => serde_json::from_str(&raw).context("parsing LAUNCHPAD_BUILD_NODE_SELECTOR")?,
            None => BTreeMap::new(),
        };
        let spec_config = match var("LAUNCHPAD_SPEC_CONFIG") {
            Some(raw) => parse_spec_config(&raw).context("parsing LAUNCHPAD_SPEC_CONFIG")?,
            None => Vec::new(),
        };
        let build_backend = match var("LAUNCHPAD_BUILD_BACKEND") {
            Some(raw) => raw.parse()?,
            None => d.build_backend,
        };

        let build = BuildOptions {
            namespace: var("LAUNCHPAD_BUILD_NAMESPACE").unwrap_or(db.namespace),
            builder_image: var("LAUNCHPAD_BUILD_IMAGE").unwrap_or(db.builder_image),
            docker_host: var("LAUNCHPAD_BUILD_DOCKER_HOST").unwrap_or(db.docker_host),
            push_secret: var("LAUNCHPAD_PUSH_SECRET"),
            memory_limit: var("LAUNCHPAD_BUILD_MEMORY_LIMIT"),
            memory_request: var("LAUNCHPAD_BUILD_MEMORY_REQUEST"),
            cpu_limit: var("LAUNCHPAD_BUILD_CPU_LIMIT"),
            cpu_request: var("LAUNCHPAD_BUILD_CPU_REQUEST"),
            node_selector,
            appendix: var("LAUNCHPAD_APPENDIX"),
            proxy: var("LAUNCHPAD_BUILD_PROXY"),
            no_proxy: var("LAUNCHPAD_BUILD_NO_PROXY"),
            log_tail_lines: var("LAUNCHPAD_LOG_TAIL_LINES").and_then(|s| s.parse().ok()).unwrap_or(db.log_tail_lines),
            sticky_builds: flag("LAUNCHPAD_STICKY_BUILDS", db.sticky_builds),
        };

        Ok(Self {
            image_prefix: var("LAUNCHPAD_IMAGE_PREFIX").unwrap_or(d.image_prefix),
            use_registry: flag("LAUNCHPAD_USE_REGISTRY", d.use_registry),
            launch_host: var("LAUNCHPAD_LAUNCH_HOST").unwrap_or(d.launch_host),
            build,
            build_backend,
            per_repo_quota: var("LAUNCHPAD_PER_REPO_QUOTA").and_then(|s| s.parse().ok()),
            per_repo_quota_higher: var("LAUNCHPAD_PER_REPO_QUOTA_HIGHER").and_then(|s| s.parse().ok()),
            pod_quota: var("LAUNCHPAD_POD_QUOTA").and_then(|s| s.parse().ok()),
            banned_specs: var("LAUNCHPAD_BANNED_SPECS").map(|s| split_list(&s)).unwrap_or_default(),
            high_quota_specs: var("LAUNCHPAD_HIGH_QUOTA_SPECS").map(|s| split_list(&s)).unwrap_or_default(),
            spec_config,
            rate_limit: var("LAUNCHPAD_RATE_LIMIT").and_then(|s| s.parse().ok()).unwrap_or(d.rate_limit),
            rate_limit_period: var("LAUNCHPAD_RATE_LIMIT_PERIOD_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.rate_limit_period),
            rate_limit_clean: var("LAUNCHPAD_RATE_LIMIT_CLEAN_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.rate_limit_clean),
            rate_limit_url: var("LAUNCHPAD_RATE_LIMIT_URL"),
            rate_limit_token: var("LAUNCHPAD_RATE_LIMIT_TOKEN"),
            heartbeat_interval: var("LAUNCHPAD_HEARTBEAT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.heartbeat_interval),
            event_queue_cap: var("LAUNCHPAD_EVENT_QUEUE_CAP").and_then(|s| s.parse().ok()).unwrap_or(d.event_queue_cap),
            launch_retries: var("LAUNCHPAD_LAUNCH_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(d.launch_retries),
            launch_retry_delay: var("LAUNCHPAD_LAUNCH_RETRY_DELAY_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.launch_retry_delay),
            health_retry_delay: var("LAUNCHPAD_HEALTH_RETRY_DELAY_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.health_retry_delay),
            launcher: LauncherConfig::from_env(),
            registry: RegistryConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_split_on_semicolons() {
        assert_eq!(split_list(" gh/org/.* ; ;gl/x "), vec!["gh/org/.*", "gl/x"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("Kubernetes".parse::<BuildBackend>().unwrap(), BuildBackend::Kubernetes);
        assert_eq!("local".parse::<BuildBackend>().unwrap(), BuildBackend::Local);
        assert!("docker".parse::<BuildBackend>().is_err());
    }

    #[test]
    fn defaults_match_rate_limiter() {
        let s = Settings::default();
        assert_eq!((s.rate_limit, s.rate_limit_period), (DEFAULT_LIMIT, DEFAULT_PERIOD_SECONDS));
        assert!(s.use_registry);
        assert_eq!(s.pod_quota, None);
    }
}
