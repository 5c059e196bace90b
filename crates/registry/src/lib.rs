//! Launchpad registry client.
//!
//! Answers "does this image already exist?" against a Docker registry v2
//! API. A token endpoint is used directly when one is known for the host;
//! otherwise the first `401` carries a bearer challenge that names the
//! realm to fetch a token from.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use launchpad_core::{names, LaunchError};
use reqwest::{RequestBuilder, StatusCode};
use tracing::{debug, warn};

mod credentials;

pub use credentials::{
    auth_config_url_for, default_docker_config_path, default_token_url, default_url, Credentials, DockerConfig,
    RegistryConfig, DEFAULT_DOCKER_AUTH_URL, DEFAULT_DOCKER_REGISTRY_URL,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Unsupported or malformed auth negotiation; never retried.
    #[error("{0}")]
    Protocol(String),
    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<RegistryError> for LaunchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Protocol(m) => LaunchError::RegistryProtocol(m),
            other => LaunchError::Internal(other.to_string()),
        }
    }
}

/// Parsed `WWW-Authenticate: Bearer realm="..",service="..",scope=".."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

fn challenge_param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let start = header.find(&needle)? + needle.len();
    let len = header[start..].find('"')?;
    Some(&header[start..start + len])
}

pub fn parse_www_authenticate(header: &str) -> Result<BearerChallenge, RegistryError> {
    debug!(header, "parsing WWW-Authenticate");
    if !header.to_ascii_lowercase().starts_with("bearer ") {
        return Err(RegistryError::Protocol(format!("Only WWW-Authenticate Bearer type supported: {}", header)));
    }
    let missing = || RegistryError::Protocol(format!("Expected WWW-Authenticate to include realm service scope: {}", header));
    let realm = challenge_param(header, "realm").filter(|r| !r.is_empty()).ok_or_else(missing)?;
    let service = challenge_param(header, "service").ok_or_else(missing)?;
    let scope = challenge_param(header, "scope").ok_or_else(missing)?;
    Ok(BearerChallenge { realm: realm.to_string(), service: service.to_string(), scope: scope.to_string() })
}

/// Existence check for a fully qualified image name (`host/org/name:tag`).
#[async_trait::async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, RegistryError>;

    /// Whether the registry is reachable and answering.
    async fn ping(&self) -> Result<bool, RegistryError> { Ok(true) }
}

pub struct DockerRegistry {
    http: reqwest::Client,
    config: RegistryConfig,
    credentials: OnceLock<Credentials>,
}

impl DockerRegistry {
    pub fn new(config: RegistryConfig) -> Self { Self::with_client(reqwest::Client::new(), config) }

    pub fn with_client(http: reqwest::Client, config: RegistryConfig) -> Self { Self { http, config, credentials: OnceLock::new() } }

    /// Resolved on first use and kept for the lifetime of the client.
    pub fn credentials(&self) -> &Credentials { self.credentials.get_or_init(|| Credentials::resolve(&self.config)) }

    fn basic(&self, req: RequestBuilder) -> RequestBuilder {
        let c = self.credentials();
        if c.username.is_empty() && c.password.is_empty() {
            req
        } else {
            req.basic_auth(&c.username, Some(&c.password))
        }
    }

    pub async fn get_token(&self, token_url: &str, service: &str, scope: &str) -> Result<String, RegistryError> {
        debug!(token_url, service, scope, "requesting registry token");
        let req = self.http.get(token_url).query(&[("scope", scope), ("service", service)]);
        let resp = self.basic(req).send().await?;
        if !resp.status().is_success() {
            return Err(RegistryError::Status { status: resp.status().as_u16(), url: token_url.to_string() });
        }
        let body: serde_json::Value = resp.json().await?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| RegistryError::Protocol(format!("No token in response from registry: {}", body)))
    }

    /// Whether `<url>/v2/<repository>/manifests/<tag>` exists.
    pub async fn image_manifest_exists(&self, repository: &str, tag: &str) -> Result<bool, RegistryError> {
        let creds = self.credentials();
        let url = format!("{}/v2/{}/manifests/{}", creds.url, repository, tag);
        let token = if creds.token_url.is_empty() {
            None
        } else {
            let scope = format!("repository:{}:pull", repository);
            Some(self.get_token(&creds.token_url, "container_registry", &scope).await?)
        };
        let req = match &token {
            Some(t) => self.http.get(&url).bearer_auth(t),
            None => self.basic(self.http.get(&url)),
        };
        debug!(url = %url, "fetching image manifest");
        let resp = req.send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED if token.is_some() && creds.not_found_401 => {
                debug!(repository, tag, "treating 401 as not found");
                Ok(false)
            }
            StatusCode::UNAUTHORIZED if token.is_none() => {
                let Some(header) = resp.headers().get(reqwest::header::WWW_AUTHENTICATE) else {
                    return Err(RegistryError::Status { status: 401, url });
                };
                let header = header.to_str().map_err(|_| RegistryError::Protocol("WWW-Authenticate is not ASCII".into()))?;
                let challenge = parse_www_authenticate(header).inspect_err(|e| warn!(error = %e, "registry challenge rejected"))?;
                self.manifest_with_challenge(&url, &challenge).await
            }
            s => Err(RegistryError::Status { status: s.as_u16(), url }),
        }
    }

    async fn manifest_with_challenge(&self, url: &str, challenge: &BearerChallenge) -> Result<bool, RegistryError> {
        let token = self.get_token(&challenge.realm, &challenge.service, &challenge.scope).await?;
        debug!(url, "fetching image manifest with challenge token");
        let resp = self.http.get(url).bearer_auth(token).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(RegistryError::Status { status: s.as_u16(), url: url.to_string() }),
        }
    }
}

#[async_trait::async_trait]
impl ImageRegistry for DockerRegistry {
    async fn image_exists(&self, image: &str) -> Result<bool, RegistryError> {
        let (repository, tag) = names::registry_lookup(image);
        self.image_manifest_exists(&repository, &tag).await
    }

    /// Registries have no health endpoint; the root answering `200` or `401` means up.
    async fn ping(&self) -> Result<bool, RegistryError> {
        let url = format!("{}/", self.credentials().url);
        let resp = self.http.get(&url).timeout(Duration::from_secs(3)).send().await?;
        debug!(url = %url, status = %resp.status(), "registry ping");
        Ok(matches!(resp.status(), StatusCode::OK | StatusCode::UNAUTHORIZED))
    }
}

/// In-process registry holding a set of image names; for tests and dry runs.
#[derive(Default)]
pub struct MemoryRegistry {
    images: Mutex<BTreeSet<String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, image: &str) { self.images.lock().unwrap_or_else(|p| p.into_inner()).insert(image.to_string()); }

    pub fn contains(&self, image: &str) -> bool { self.images.lock().unwrap_or_else(|p| p.into_inner()).contains(image) }
}

#[async_trait::async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn image_exists(&self, image: &str) -> Result<bool, RegistryError> { Ok(self.contains(image)) }
}
