//! Registry endpoint and credential defaults, read from a docker `config.json`.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

pub const DEFAULT_DOCKER_REGISTRY_URL: &str = "https://registry-1.docker.io";
pub const DEFAULT_DOCKER_AUTH_URL: &str = "https://index.docker.io/v1";

/// Explicit registry settings. Every `None` falls back to the docker config
/// (or a well-known default) when the client first needs it.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub url: Option<String>,
    pub auth_config_url: Option<String>,
    pub token_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub docker_config_path: Option<PathBuf>,
    /// Treat a `401` on a token-authenticated manifest request as "absent".
    pub not_found_401: Option<bool>,
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|s| !s.is_empty());
        Self {
            url: var("LAUNCHPAD_REGISTRY_URL"),
            auth_config_url: var("LAUNCHPAD_REGISTRY_AUTH_CONFIG_URL"),
            token_url: var("LAUNCHPAD_REGISTRY_TOKEN_URL"),
            username: var("LAUNCHPAD_REGISTRY_USERNAME"),
            password: var("LAUNCHPAD_REGISTRY_PASSWORD"),
            docker_config_path: var("LAUNCHPAD_DOCKER_CONFIG_PATH").map(PathBuf::from),
            not_found_401: var("LAUNCHPAD_REGISTRY_NOT_FOUND_401").and_then(|s| s.parse().ok()),
        }
    }
}

/// Fully resolved view of [`RegistryConfig`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub auth_config_url: String,
    pub token_url: String,
    pub username: String,
    pub password: String,
    pub not_found_401: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("auth_config_url", &self.auth_config_url)
            .field("token_url", &self.token_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("not_found_401", &self.not_found_401)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: Auths,
}

/// `auths` entries in file order.
#[derive(Debug, Default)]
pub struct Auths(Vec<(String, DockerAuth)>);

impl Auths {
    pub fn get(&self, key: &str) -> Option<&DockerAuth> { self.0.iter().find(|(k, _)| k == key).map(|(_, a)| a) }

    pub fn contains_key(&self, key: &str) -> bool { self.get(key).is_some() }

    pub fn first_key(&self) -> Option<&str> { self.0.first().map(|(k, _)| k.as_str()) }
}

impl FromIterator<(String, DockerAuth)> for Auths {
    fn from_iter<I: IntoIterator<Item = (String, DockerAuth)>>(iter: I) -> Self {
        let mut auths = Auths::default();
        for (key, auth) in iter {
            match auths.0.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = auth,
                None => auths.0.push((key, auth)),
            }
        }
        auths
    }
}

impl<'de> Deserialize<'de> for Auths {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AuthsVisitor;

        impl<'de> Visitor<'de> for AuthsVisitor {
            type Value = Auths;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("a map of registry auth entries") }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Auths, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, DockerAuth>()? {
                    entries.push(entry);
                }
                Ok(entries.into_iter().collect())
            }
        }

        deserializer.deserialize_map(AuthsVisitor)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerAuth {
    #[serde(default)]
    pub auth: Option<String>,
}

impl DockerConfig {
    /// A missing or unreadable file is an empty config.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                warn!(path = %path.display(), "no docker config");
                return Self::default();
            }
        };
        info!(path = %path.display(), "loading docker config");
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid docker config");
            Self::default()
        })
    }

    /// `user:password` stored for `key`, decoded.
    pub fn basic_auth(&self, key: &str) -> Option<(String, String)> {
        let b64 = self.auths.get(key)?.auth.as_deref().filter(|s| !s.is_empty())?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(b64.trim()).ok()?;
        let text = String::from_utf8_lossy(&decoded);
        let (user, pass) = text.split_once(':').unwrap_or((&text, ""));
        Some((user.to_string(), pass.to_string()))
    }
}

/// `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`.
pub fn default_docker_config_path() -> PathBuf {
    let dir = std::env::var("DOCKER_CONFIG").map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_default();
        Path::new(&home).join(".docker")
    });
    dir.join("config.json")
}

fn hostname(url: &str) -> String { reqwest::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default() }

/// First configured auth entry (in file order), else Docker Hub.
pub fn default_url(docker: &DockerConfig) -> String {
    let Some(key) = docker.auths.first_key() else {
        return DEFAULT_DOCKER_REGISTRY_URL.to_string();
    };
    let url = if key.contains("://") { key.to_string() } else { format!("https://{}", key) };
    if url.trim_end_matches('/') == DEFAULT_DOCKER_AUTH_URL {
        return DEFAULT_DOCKER_REGISTRY_URL.to_string();
    }
    url
}

/// Key under which credentials for `url` are stored in the docker config.
pub fn auth_config_url_for(url: &str, docker: &DockerConfig) -> String {
    if docker.auths.contains_key(url) {
        return url.to_string();
    }
    let host = hostname(url);
    if docker.auths.contains_key(&host) {
        return host;
    }
    let dotted = format!(".{}", host);
    if dotted.ends_with(".docker.io") || dotted.ends_with(".docker.com") {
        return DEFAULT_DOCKER_AUTH_URL.to_string();
    }
    url.to_string()
}

/// Token endpoint for registries that need no challenge discovery; empty otherwise.
pub fn default_token_url(url: &str) -> String {
    let host = hostname(url);
    if format!(".{}", host).ends_with(".gcr.io") {
        format!("https://{0}/v2/token?service={0}", host)
    } else if url.ends_with(".docker.io") {
        "https://auth.docker.io/token?service=registry.docker.io".to_string()
    } else {
        String::new()
    }
}

impl Credentials {
    pub fn resolve(config: &RegistryConfig) -> Self {
        let path = config.docker_config_path.clone().unwrap_or_else(default_docker_config_path);
        let docker = DockerConfig::load(&path);
        let url = config.url.clone().unwrap_or_else(|| default_url(&docker)).trim_end_matches('/').to_string();
        let auth_config_url = config.auth_config_url.clone().unwrap_or_else(|| auth_config_url_for(&url, &docker));
        let token_url = config.token_url.clone().unwrap_or_else(|| default_token_url(&url));
        let stored = docker.basic_auth(&auth_config_url);
        if stored.is_none() && (config.username.is_none() || config.password.is_none()) {
            warn!(auth_config_url = %auth_config_url, "no credentials for docker registry");
        }
        let (stored_user, stored_pass) = stored.unwrap_or_default();
        Self {
            not_found_401: config.not_found_401.unwrap_or_else(|| url.ends_with(".docker.io")),
            username: config.username.clone().unwrap_or(stored_user),
            password: config.password.clone().unwrap_or(stored_pass),
            url,
            auth_config_url,
            token_url,
        }
    }
}
