//! Launchpad launcher.
//!
//! Turns a built image into a running server on the session hub: create a
//! temporary user (or check an authenticated one), ask the hub to start a
//! server from the image, then poll until the hub reports it ready. Hub
//! requests are retried on `5xx` with a doubling delay.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use launchpad_core::backoff::{exponential_backoff, Backoff, BackoffError};
use launchpad_core::LaunchError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

/// Characters of the random suffix added to generated user names.
const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LENGTH: usize = 8;

/// User names are escaped the way the hub escapes them in server URLs.
const USERNAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'.').remove(b'-').remove(b'~').remove(b'@');

#[derive(Clone)]
pub struct LauncherConfig {
    /// Public hub URL, used for the server URL handed to users.
    pub hub_url: String,
    /// Hub URL reachable from here, if different from `hub_url`.
    pub hub_url_local: Option<String>,
    /// Full API base; defaults to `<hub_url_local>hub/api/`.
    pub hub_api_url: Option<String>,
    pub hub_api_token: String,
    /// Create a temporary user per launch. Off when users authenticate.
    pub create_user: bool,
    pub allow_named_servers: bool,
    /// Zero means no limit.
    pub named_server_limit_per_user: usize,
    /// Attempts per hub request.
    pub retries: u32,
    /// First delay between attempts; doubles each retry.
    pub retry_delay: Duration,
    pub launch_timeout: Duration,
    /// First wait between readiness polls.
    pub poll_interval: Duration,
}

impl std::fmt::Debug for LauncherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherConfig")
            .field("hub_url", &self.hub_url)
            .field("hub_url_local", &self.hub_url_local)
            .field("hub_api_url", &self.hub_api_url)
            .field("hub_api_token", &"<redacted>")
            .field("create_user", &self.create_user)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("launch_timeout", &self.launch_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            hub_url: "http://localhost:8000/".into(),
            hub_url_local: None,
            hub_api_url: None,
            hub_api_token: String::new(),
            create_user: true,
            allow_named_servers: false,
            named_server_limit_per_user: 0,
            retries: 4,
            retry_delay: Duration::from_secs(4),
            launch_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl LauncherConfig {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        let d = Self::default();
        Self {
            hub_url: var("LAUNCHPAD_HUB_URL").unwrap_or(d.hub_url),
            hub_url_local: var("LAUNCHPAD_HUB_URL_LOCAL"),
            hub_api_url: var("JUPYTERHUB_API_URL"),
            hub_api_token: var("JUPYTERHUB_API_TOKEN").unwrap_or_default(),
            create_user: var("LAUNCHPAD_AUTH_ENABLED").map(|v| v != "true").unwrap_or(true),
            allow_named_servers: var("JUPYTERHUB_ALLOW_NAMED_SERVERS").is_some_and(|v| v == "true"),
            named_server_limit_per_user: var("JUPYTERHUB_NAMED_SERVER_LIMIT_PER_USER").and_then(|s| s.parse().ok()).unwrap_or(0),
            retries: var("LAUNCHPAD_HUB_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(d.retries),
            retry_delay: var("LAUNCHPAD_HUB_RETRY_DELAY_SECS").and_then(|s| s.parse().ok()).map(Duration::from_secs).unwrap_or(d.retry_delay),
            launch_timeout: var("LAUNCHPAD_LAUNCH_TIMEOUT_SECS").and_then(|s| s.parse().ok()).map(Duration::from_secs).unwrap_or(d.launch_timeout),
            poll_interval: d.poll_interval,
        }
    }

    fn public_url(&self) -> String { with_slash(&self.hub_url) }

    fn health_url(&self) -> String { format!("{}hub/health", with_slash(self.hub_url_local.as_deref().unwrap_or(&self.hub_url))) }

    fn api_url(&self) -> String {
        match &self.hub_api_url {
            Some(url) => with_slash(url),
            None => format!("{}hub/api/", with_slash(self.hub_url_local.as_deref().unwrap_or(&self.hub_url))),
        }
    }
}

fn with_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

/// A failed hub request, after retries.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub returned {status} for {path}")]
    Status { status: u16, path: String, body: String },
    #[error("hub request {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected hub response for {path}: {message}")]
    Decode { path: String, message: String },
}

impl HubError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HubError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchFailure {
    #[error("Failed to create temporary user for {image}")]
    CreateUser {
        username: String,
        image: String,
        #[source]
        source: HubError,
    },
    #[error("User {username} already has a running server.")]
    ServerExists { username: String },
    #[error("User {username} already has the maximum of {limit} named servers.  One must be deleted before a new server can be created")]
    NamedServerLimit { username: String, limit: usize },
    #[error("Failed to look up user {username}")]
    UserData {
        username: String,
        #[source]
        source: HubError,
    },
    #[error("Failed to launch image {image}")]
    Start {
        username: String,
        image: String,
        #[source]
        source: HubError,
    },
    #[error("Image {image} for user {username} failed to launch: {message}")]
    Failed { username: String, image: String, message: String },
    #[error("Image {image} for user {username} took too long to launch")]
    Timeout { username: String, image: String },
}

impl From<LaunchFailure> for LaunchError {
    fn from(e: LaunchFailure) -> Self { LaunchError::LaunchFailed(e.to_string()) }
}

/// One server to start.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub image: String,
    pub username: String,
    /// Empty for the user's default server.
    pub server_name: String,
    pub repo_url: String,
    /// Merged into the options the hub's spawner receives.
    pub extra_args: Map<String, Value>,
}

impl LaunchRequest {
    pub fn new(image: &str, username: &str, repo_url: &str) -> Self {
        Self {
            image: image.to_string(),
            username: username.to_string(),
            server_name: String::new(),
            repo_url: repo_url.to_string(),
            extra_args: Map::new(),
        }
    }

    pub fn with_server_name(mut self, server_name: &str) -> Self {
        self.server_name = server_name.to_string();
        self
    }

    pub fn with_extra_args(mut self, extra_args: Map<String, Value>) -> Self {
        self.extra_args = extra_args;
        self
    }
}

/// A ready server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchInfo {
    pub url: String,
    pub token: String,
    pub image: String,
    pub repo_url: String,
    #[serde(flatten)]
    pub extra_args: Map<String, Value>,
}

#[async_trait::async_trait]
pub trait Launch: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchInfo, LaunchFailure>;

    /// Check that the hub answers its health endpoint.
    async fn ping(&self) -> anyhow::Result<()> { Ok(()) }
}

/// A unique user name for a repository, e.g. `org-binder-example-k2j4x9qa`
/// for `https://github.com/org/binder-example.git`.
pub fn unique_name_from_repo(repo_url: &str) -> String { format!("{}-{}", repo_name_prefix(repo_url), random_suffix(SUFFIX_LENGTH)) }

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| SUFFIX_CHARS[rng.gen_range(0..SUFFIX_CHARS.len())] as char).collect()
}

/// Name for an extra named server of an authenticated user.
pub fn random_server_name() -> String { random_suffix(12) }

fn is_ssh_url(url: &str) -> bool { !url.contains("://") && url.find('@').is_some_and(|at| url[at..].contains(':')) }

fn repo_name_prefix(repo_url: &str) -> String {
    let path = if is_ssh_url(repo_url) {
        repo_url.split_once(':').map(|(_, p)| p.to_string()).unwrap_or_default()
    } else {
        match reqwest::Url::parse(repo_url) {
            Ok(u) => u.path().to_string(),
            Err(_) => repo_url.split(['?', '#']).next().unwrap_or_default().to_string(),
        }
    };
    let mut prefix = path.trim_matches('/').replace('/', "-").to_lowercase();
    if let Some(stripped) = prefix.strip_suffix(".git") {
        prefix = stripped.to_string();
    }
    let chars: Vec<char> = prefix.chars().collect();
    if chars.len() > 32 {
        let head: String = chars[..15].iter().collect();
        let tail: String = chars[chars.len() - 15..].iter().collect();
        prefix = format!("{}-{}", head, tail);
    }
    prefix
}

/// Url-safe base64 of a random UUID, unpadded.
pub fn new_server_token() -> String { base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes()) }

pub fn escape_username(username: &str) -> String { utf8_percent_encode(username, USERNAME).to_string() }

#[derive(Deserialize)]
struct UserModel {
    #[serde(default)]
    servers: Map<String, Value>,
}

pub struct Launcher {
    http: reqwest::Client,
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self { Self { http: reqwest::Client::new(), config } }

    pub fn config(&self) -> &LauncherConfig { &self.config }

    async fn api_request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response, HubError> {
        let url = format!("{}{}", self.config.api_url(), path);
        let retries = self.config.retries.max(1);
        let mut delay = self.config.retry_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header(reqwest::header::AUTHORIZATION, format!("token {}", self.config.hub_api_token));
            if let Some(b) = body {
                req = req.json(b);
            }
            let failure = match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if attempt > 1 && resp.status() == StatusCode::CONFLICT => {
                    warn!(path, "treating 409 conflict on retry as success");
                    return Ok(resp);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let e = HubError::Status { status: status.as_u16(), path: path.to_string(), body };
                    if !status.is_server_error() {
                        return Err(e);
                    }
                    e
                }
                // Connection errors are retried like 5xx.
                Err(source) => HubError::Transport { path: path.to_string(), source },
            };
            error!(url = %url, attempt, error = %failure, "error accessing hub API");
            if attempt >= retries {
                return Err(failure);
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    async fn user_model(&self, escaped: &str) -> Result<UserModel, HubError> {
        let path = format!("users/{}", escaped);
        let resp = self.api_request(Method::GET, &path, None).await?;
        resp.json().await.map_err(|e| HubError::Decode { path, message: e.to_string() })
    }

    /// `Some` once the server is ready; an error if it vanished while starting.
    async fn server_ready(&self, escaped: &str, server_name: &str) -> anyhow::Result<Option<()>> {
        let user = self.user_model(escaped).await?;
        let Some(server) = user.servers.get(server_name) else {
            anyhow::bail!("server stopped while starting");
        };
        if server.get("ready").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(Some(()));
        }
        debug!(user = %escaped, pending = ?server.get("pending"), "server not ready yet");
        Ok(None)
    }

    async fn check_user(&self, request: &LaunchRequest, escaped: &str) -> Result<(), LaunchFailure> {
        let username = &request.username;
        if self.config.create_user {
            info!(user = %username, image = %request.image, "creating user");
            return match self.api_request(Method::POST, &format!("users/{}", escaped), None).await {
                Ok(_) => Ok(()),
                Err(source) => {
                    error!(user = %username, error = %source, "error creating user");
                    Err(LaunchFailure::CreateUser { username: username.clone(), image: request.image.clone(), source })
                }
            };
        }
        let named = !request.server_name.is_empty();
        let limit = self.config.named_server_limit_per_user;
        if named && limit == 0 {
            return Ok(());
        }
        let user = self
            .user_model(escaped)
            .await
            .map_err(|source| LaunchFailure::UserData { username: username.clone(), source })?;
        if !named {
            if user.servers.contains_key("") {
                return Err(LaunchFailure::ServerExists { username: username.clone() });
            }
        } else if user.servers.keys().filter(|k| !k.is_empty()).count() >= limit {
            return Err(LaunchFailure::NamedServerLimit { username: username.clone(), limit });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Launch for Launcher {
    async fn ping(&self) -> anyhow::Result<()> {
        let url = self.config.health_url();
        let resp = self.http.get(&url).timeout(Duration::from_secs(2)).send().await.with_context(|| format!("GET {}", url))?;
        resp.error_for_status().with_context(|| format!("GET {}", url))?;
        debug!(url = %url, "hub healthy");
        Ok(())
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchInfo, LaunchFailure> {
        let escaped = escape_username(&request.username);
        let username = request.username.clone();
        self.check_user(request, &escaped).await?;

        let token = new_server_token();
        let mut data = json!({"image": request.image, "repo_url": request.repo_url, "token": token});
        if let Value::Object(m) = &mut data {
            m.extend(request.extra_args.clone());
        }

        info!(user = %username, server = %request.server_name, image = %request.image, "starting server");
        let path = format!("users/{}/servers/{}", escaped, request.server_name);
        if let Err(source) = self.api_request(Method::POST, &path, Some(&data)).await {
            error!(user = %username, error = %source, "error starting server");
            return Err(LaunchFailure::Start { username, image: request.image.clone(), source });
        }

        let opts = Backoff {
            start_wait: self.config.poll_interval,
            max_wait: Duration::from_secs(10),
            timeout: self.config.launch_timeout,
            ..Backoff::default()
        };
        let (escaped_ref, server_ref) = (escaped.as_str(), request.server_name.as_str());
        match exponential_backoff(move || self.server_ready(escaped_ref, server_ref), "server never became ready", &opts).await {
            Ok(()) => {}
            Err(BackoffError::Timeout(_)) => {
                warn!(user = %username, image = %request.image, "server did not become ready in time");
                return Err(LaunchFailure::Timeout { username, image: request.image.clone() });
            }
            Err(BackoffError::Failed(e)) => {
                return Err(LaunchFailure::Failed { username, image: request.image.clone(), message: format!("{:#}", e) });
            }
        }

        let url = format!("{}user/{}/{}", self.config.public_url(), escaped, request.server_name);
        debug!(url = %url, "server ready");
        Ok(LaunchInfo {
            url,
            token,
            image: request.image.clone(),
            repo_url: request.repo_url.clone(),
            extra_args: request.extra_args.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_come_from_the_repo_path() {
        assert_eq!(repo_name_prefix("https://github.com/Org/Binder-Example.git"), "org-binder-example");
        assert_eq!(repo_name_prefix("git@github.com:org/repo.git"), "org-repo");
        assert_eq!(repo_name_prefix("https://gitlab.com/group/sub/project/"), "group-sub-project");
    }

    #[test]
    fn long_names_keep_both_ends() {
        let prefix = repo_name_prefix("https://github.com/a-very-long-organisation-name/and-an-even-longer-repository");
        assert_eq!(prefix, "a-very-long-org-nger-repository");
        assert!(prefix.len() <= 31);
    }

    #[test]
    fn unique_names_get_a_random_suffix() {
        let a = unique_name_from_repo("https://github.com/org/repo");
        let b = unique_name_from_repo("https://github.com/org/repo");
        assert_ne!(a, b);
        let suffix = a.strip_prefix("org-repo-").unwrap();
        assert_eq!(suffix.len(), SUFFIX_LENGTH);
        assert!(suffix.bytes().all(|c| SUFFIX_CHARS.contains(&c)));
    }

    #[test]
    fn tokens_are_unpadded_urlsafe() {
        let t = new_server_token();
        assert_eq!(t.len(), 22);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn usernames_escape_like_the_hub() {
        assert_eq!(escape_username("me@example.org"), "me@example.org");
        assert_eq!(escape_username("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn api_url_defaults_under_local_hub() {
        let cfg = LauncherConfig { hub_url: "https://hub.example".into(), ..LauncherConfig::default() };
        assert_eq!(cfg.api_url(), "https://hub.example/hub/api/");
        let cfg = LauncherConfig { hub_url_local: Some("http://hub:8081/".into()), ..cfg };
        assert_eq!(cfg.api_url(), "http://hub:8081/hub/api/");
        let cfg = LauncherConfig { hub_api_url: Some("http://api/x".into()), ..cfg };
        assert_eq!(cfg.api_url(), "http://api/x/");
        assert_eq!(cfg.public_url(), "https://hub.example/");
    }
}
