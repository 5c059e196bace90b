//! Launchpad repo providers.
//!
//! A provider turns a raw spec (`org/repo/ref`, a DOI, an encoded URL plus
//! ref, ...) into a repository URL, an immutable ref and a build slug. The
//! slug only depends on repository identity, never on the ref.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use launchpad_core::LaunchError;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::sync::OnceCell;
use tracing::debug;

mod doi;
mod git;
mod github;
mod gitlab;
mod policy;

pub use doi::{DataverseProvider, FigshareProvider, HydroshareProvider, ZenodoProvider};
pub use git::{parse_ls_remote, GistProvider, GitProvider};
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use policy::{parse_spec_config, RepoConfig, SpecConfigRule, SpecPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Spec does not parse for this provider.
    #[error("{0}")]
    InvalidSpec(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("No provider found for prefix {0:?}")]
    UnknownProvider(String),
    #[error("Invalid spec configuration: {0}")]
    InvalidConfig(String),
    /// The slug depends on the resolved ref, which has not been looked up.
    #[error("{0} has not been resolved yet")]
    Unresolved(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ProviderError> for LaunchError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Other(e) => LaunchError::Internal(format!("{:#}", e)),
            e @ ProviderError::Unresolved(_) => LaunchError::Internal(e.to_string()),
            other => LaunchError::Validation(other.to_string()),
        }
    }
}

/// Characters left alone by `quote(s, safe='')`.
const QUOTE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'.').remove(b'-').remove(b'~');

pub fn quote(s: &str) -> String { utf8_percent_encode(s, QUOTE).to_string() }

pub fn unquote(s: &str) -> String { percent_decode_str(s).decode_utf8_lossy().into_owned() }

pub fn strip_suffix<'a>(text: &'a str, suffix: &str) -> &'a str { text.strip_suffix(suffix).unwrap_or(text) }

pub fn is_sha1(s: &str) -> bool { s.len() == 40 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) }

/// Split `user/repo/ref`; the ref may itself contain slashes.
pub fn tokenize_spec(spec: &str) -> Result<(String, String, String), ProviderError> {
    let parts: Vec<&str> = spec.splitn(3, '/').collect();
    match parts.as_slice() {
        [user, repo, r] => Ok((user.to_string(), repo.to_string(), r.to_string())),
        _ => {
            let mut msg = format!("Spec is not of the form \"user/repo/ref\", provided: \"{}\".", spec);
            if parts.len() == 2 && parts[1] != "master" {
                msg.push_str(&format!(" Did you mean \"{}/master\"?", spec));
            }
            Err(ProviderError::InvalidSpec(msg))
        }
    }
}

/// Configuration shared by all providers.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub http: reqwest::Client,
    pub github_api_url: String,
    pub github_access_token: Option<String>,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,
    pub gitlab_url: String,
    pub gitlab_private_token: Option<String>,
    pub gitlab_access_token: Option<String>,
    pub allow_secret_gist: bool,
    pub git_command: String,
    pub doi_resolver: String,
    pub zenodo_hosts: Vec<String>,
    pub figshare_hosts: Vec<String>,
    pub dataverse_hosts: Vec<String>,
    pub hydroshare_hosts: Vec<String>,
}

impl Default for ProviderContext {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            github_api_url: "https://api.github.com".into(),
            github_access_token: None,
            github_client_id: None,
            github_client_secret: None,
            gitlab_url: "https://gitlab.com".into(),
            gitlab_private_token: None,
            gitlab_access_token: None,
            allow_secret_gist: false,
            git_command: "git".into(),
            doi_resolver: "https://doi.org/".into(),
            zenodo_hosts: vec!["https://zenodo.org/record/".into(), "https://sandbox.zenodo.org/record/".into()],
            figshare_hosts: vec!["https://figshare.com/articles/".into()],
            dataverse_hosts: vec!["https://dataverse.harvard.edu".into()],
            hydroshare_hosts: vec!["https://www.hydroshare.org/resource/".into()],
        }
    }
}

impl ProviderContext {
    /// Defaults plus credentials from their conventional environment variables.
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            github_access_token: var("GITHUB_ACCESS_TOKEN"),
            github_client_id: var("GITHUB_CLIENT_ID"),
            github_client_secret: var("GITHUB_CLIENT_SECRET"),
            gitlab_private_token: var("GITLAB_PRIVATE_TOKEN"),
            gitlab_access_token: var("GITLAB_ACCESS_TOKEN"),
            ..Self::default()
        }
    }
}

/// One repository host.
#[async_trait::async_trait]
pub trait RepoProvider: Send + Sync {
    /// Human readable provider name.
    fn name(&self) -> &'static str;

    fn spec(&self) -> &str;

    fn unresolved_ref(&self) -> &str;

    fn repo_url(&self) -> String;

    /// Stable name of the repository, independent of the ref. `None` while
    /// it still depends on `lookup_ref`.
    fn build_slug(&self) -> Option<String>;

    /// Look up the immutable ref. `Ok(None)` when the ref does not exist.
    /// Uncached; go through [`RepoSpec::resolved_ref`].
    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError>;

    /// Browsable URL of the resolved ref, when the host has one.
    fn ref_url(&self, _resolved_ref: &str) -> Option<String> { None }

    /// The spec rewritten to pin the resolved ref.
    fn resolved_spec(&self, _resolved_ref: &str) -> String { self.spec().to_string() }

    /// Git credential helper content passed to the builder.
    fn git_credentials(&self) -> Option<String> { None }
}

/// A provider bound to one spec, with the resolved ref memoized.
pub struct RepoSpec {
    prefix: String,
    provider: Box<dyn RepoProvider>,
    resolved: OnceCell<Option<String>>,
}

impl std::fmt::Debug for RepoSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSpec").field("prefix", &self.prefix).field("spec", &self.provider.spec()).finish()
    }
}

impl RepoSpec {
    pub fn new(prefix: &str, provider: Box<dyn RepoProvider>) -> Self {
        Self { prefix: prefix.to_string(), provider, resolved: OnceCell::new() }
    }

    pub fn prefix(&self) -> &str { &self.prefix }

    pub fn raw_spec(&self) -> &str { self.provider.spec() }

    pub fn provider(&self) -> &dyn RepoProvider { self.provider.as_ref() }

    pub fn repo_url(&self) -> String { self.provider.repo_url() }

    pub fn build_slug(&self) -> Result<String, ProviderError> {
        self.provider.build_slug().ok_or_else(|| ProviderError::Unresolved(format!("{}:{}", self.prefix, self.provider.spec())))
    }

    pub fn unresolved_ref(&self) -> &str { self.provider.unresolved_ref() }

    /// Resolve once; later calls return the cached answer. Errors are not cached.
    pub async fn resolved_ref(&self) -> Result<Option<String>, ProviderError> {
        let r = self
            .resolved
            .get_or_try_init(|| async {
                debug!(prefix = %self.prefix, spec = %self.provider.spec(), "resolving ref");
                self.provider.lookup_ref().await
            })
            .await?;
        Ok(r.clone())
    }

    /// The ref if it has already been resolved.
    pub fn cached_ref(&self) -> Option<&str> { self.resolved.get().and_then(|r| r.as_deref()) }
}

type Factory = Arc<dyn Fn(&str, &Arc<ProviderContext>) -> Result<Box<dyn RepoProvider>, ProviderError> + Send + Sync>;

/// Maps a short prefix (`gh`, `gl`, ...) to a provider constructor.
#[derive(Clone)]
pub struct ProviderRegistry {
    ctx: Arc<ProviderContext>,
    factories: BTreeMap<String, Factory>,
}

impl ProviderRegistry {
    pub fn new(ctx: ProviderContext) -> Self { Self { ctx: Arc::new(ctx), factories: BTreeMap::new() } }

    pub fn with_defaults(ctx: ProviderContext) -> Self {
        let mut r = Self::new(ctx);
        r.register("gh", |spec, ctx| Ok(Box::new(GitHubProvider::new(spec, ctx.clone())?)));
        r.register("gl", |spec, ctx| Ok(Box::new(GitLabProvider::new(spec, ctx.clone())?)));
        r.register("git", |spec, ctx| Ok(Box::new(GitProvider::new(spec, ctx.clone())?)));
        r.register("gist", |spec, ctx| Ok(Box::new(GistProvider::new(spec, ctx.clone())?)));
        r.register("zenodo", |spec, ctx| Ok(Box::new(ZenodoProvider::new(spec, ctx.clone()))));
        r.register("figshare", |spec, ctx| Ok(Box::new(FigshareProvider::new(spec, ctx.clone()))));
        r.register("dataverse", |spec, ctx| Ok(Box::new(DataverseProvider::new(spec, ctx.clone()))));
        r.register("hydroshare", |spec, ctx| Ok(Box::new(HydroshareProvider::new(spec, ctx.clone()))));
        r.register("fake", |spec, _| Ok(Box::new(FakeProvider::new(spec))));
        r
    }

    pub fn register<F>(&mut self, prefix: &str, factory: F)
    where
        F: Fn(&str, &Arc<ProviderContext>) -> Result<Box<dyn RepoProvider>, ProviderError> + Send + Sync + 'static,
    {
        self.factories.insert(prefix.to_string(), Arc::new(factory));
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> { self.factories.keys().map(|k| k.as_str()) }

    pub fn context(&self) -> &ProviderContext { &self.ctx }

    /// Parse `spec` with the provider registered under `prefix`.
    pub fn spec(&self, prefix: &str, spec: &str) -> Result<RepoSpec, ProviderError> {
        let factory = self.factories.get(prefix).ok_or_else(|| ProviderError::UnknownProvider(prefix.to_string()))?;
        Ok(RepoSpec::new(prefix, factory(spec, &self.ctx)?))
    }
}

/// Provider with fixed answers, for local UI work.
pub struct FakeProvider {
    spec: String,
}

impl FakeProvider {
    pub fn new(spec: &str) -> Self { Self { spec: spec.to_string() } }
}

#[async_trait::async_trait]
impl RepoProvider for FakeProvider {
    fn name(&self) -> &'static str { "Fake" }
    fn spec(&self) -> &str { &self.spec }
    fn unresolved_ref(&self) -> &str { "master" }
    fn repo_url(&self) -> String { "fake/repo".into() }
    fn build_slug(&self) -> Option<String> { Some("Rick-Morty".into()) }
    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> { Ok(Some("1a2b3c4d5e6f".into())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_keeps_slashes_in_ref() {
        assert_eq!(
            tokenize_spec("user/repo/hotfix/squash-bug").unwrap(),
            ("user".into(), "repo".into(), "hotfix/squash-bug".into())
        );
        let (_, _, r) = tokenize_spec("a/long/specification/with/many/slashes").unwrap();
        assert_eq!(r, "specification/with/many/slashes");
    }

    #[test]
    fn two_part_spec_suggests_master() {
        let err = tokenize_spec("short/suggestion").unwrap_err().to_string();
        assert!(err.starts_with("Spec is not of the form \"user/repo/ref\""));
        assert!(err.contains("Did you mean \"short/suggestion/master\"?"));

        let err = tokenize_spec("short/master").unwrap_err().to_string();
        assert!(!err.contains("Did you mean"));

        let err = tokenize_spec("nothing_to_split").unwrap_err().to_string();
        assert!(!err.contains("Did you mean"));
    }

    #[test]
    fn strip_suffix_only_strips_suffix() {
        assert_eq!(strip_suffix("foo.git", ".git"), "foo");
        assert_eq!(strip_suffix("foo.bar", ".git"), "foo.bar");
        assert_eq!(strip_suffix("foo.bar", ".bar"), "foo");
    }

    #[test]
    fn quote_matches_safe_empty() {
        assert_eq!(quote("gitlab-org/gitlab-ce"), "gitlab-org%2Fgitlab-ce");
        assert_eq!(quote("https://x.org/a b"), "https%3A%2F%2Fx.org%2Fa%20b");
        assert_eq!(unquote("gitlab-org%2Fgitlab-ce"), "gitlab-org/gitlab-ce");
    }

    #[tokio::test]
    async fn unknown_prefix_is_rejected() {
        let reg = ProviderRegistry::with_defaults(ProviderContext::default());
        let err = reg.spec("svn", "x/y/z").unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider(p) if p == "svn"));
        let fake = reg.spec("fake", "anything").unwrap();
        assert_eq!(fake.resolved_ref().await.unwrap().as_deref(), Some("1a2b3c4d5e6f"));
        assert_eq!(fake.cached_ref(), Some("1a2b3c4d5e6f"));
    }
}
