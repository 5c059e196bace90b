//! Plain git remotes and GitHub gists.

use std::sync::Arc;

use anyhow::Context;
use reqwest::StatusCode;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{is_sha1, quote, unquote, ProviderContext, ProviderError, RepoProvider};

/// First sha printed by `git ls-remote`, if any.
pub fn parse_ls_remote(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .find(|sha| is_sha1(sha))
        .map(str::to_string)
}

/// Spec is `<url-encoded repository url>/<url-encoded ref>`.
pub struct GitProvider {
    spec: String,
    repo: String,
    unresolved_ref: String,
    ctx: Arc<ProviderContext>,
}

impl GitProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Result<Self, ProviderError> {
        let (quoted_repo, quoted_ref) = spec.split_once('/').ok_or_else(|| {
            ProviderError::InvalidSpec(format!(
                "Spec is not of the form \"<url-encoded repository url>/<ref>\", provided: \"{}\".",
                spec
            ))
        })?;
        let repo = unquote(quoted_repo);
        let unresolved_ref = unquote(quoted_ref);
        if unresolved_ref.is_empty() {
            return Err(ProviderError::InvalidSpec("`unresolved_ref` must be specified in the url for the basic git provider".into()));
        }
        Ok(Self { spec: spec.to_string(), repo, unresolved_ref, ctx })
    }
}

#[async_trait::async_trait]
impl RepoProvider for GitProvider {
    fn name(&self) -> &'static str { "Git" }

    fn spec(&self) -> &str { &self.spec }

    fn unresolved_ref(&self) -> &str { &self.unresolved_ref }

    fn repo_url(&self) -> String { self.repo.clone() }

    fn build_slug(&self) -> Option<String> { Some(self.repo.clone()) }

    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        if is_sha1(&self.unresolved_ref) {
            return Ok(Some(self.unresolved_ref.clone()));
        }
        debug!(repo = %self.repo, git_ref = %self.unresolved_ref, "git ls-remote");
        let out = Command::new(&self.ctx.git_command)
            .args(["ls-remote", "--", self.repo.as_str(), self.unresolved_ref.as_str()])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {} ls-remote", self.ctx.git_command))?;
        if !out.status.success() {
            warn!(repo = %self.repo, code = ?out.status.code(), "git ls-remote failed");
            return Err(anyhow::anyhow!("Unable to run git ls-remote to get the resolved_ref").into());
        }
        Ok(parse_ls_remote(&String::from_utf8_lossy(&out.stdout)))
    }

    fn resolved_spec(&self, resolved_ref: &str) -> String { format!("{}/{}", quote(&self.repo), resolved_ref) }
}

/// Spec is `user/gist_id[/ref]`; the ref defaults to `HEAD`.
pub struct GistProvider {
    spec: String,
    user: String,
    gist_id: String,
    unresolved_ref: String,
    ctx: Arc<ProviderContext>,
}

impl GistProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Result<Self, ProviderError> {
        let parts: Vec<&str> = spec.splitn(3, '/').collect();
        let (user, gist_id, r) = match parts.as_slice() {
            [u, g] => (*u, *g, "HEAD"),
            [u, g, r] => (*u, *g, *r),
            _ => {
                return Err(ProviderError::InvalidSpec(format!(
                    "Spec is not of the form \"user/id/ref\", provided: \"{}\".",
                    spec
                )))
            }
        };
        Ok(Self { spec: spec.to_string(), user: user.to_string(), gist_id: gist_id.to_string(), unresolved_ref: r.to_string(), ctx })
    }
}

#[async_trait::async_trait]
impl RepoProvider for GistProvider {
    fn name(&self) -> &'static str { "Gist" }

    fn spec(&self) -> &str { &self.spec }

    fn unresolved_ref(&self) -> &str { &self.unresolved_ref }

    fn repo_url(&self) -> String { format!("https://gist.github.com/{}/{}.git", self.user, self.gist_id) }

    fn build_slug(&self) -> Option<String> { Some(self.gist_id.clone()) }

    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        let api_url = format!("{}/gists/{}", self.ctx.github_api_url.trim_end_matches('/'), self.gist_id);
        debug!(url = %api_url, "fetching");
        let mut req = self.ctx.http.get(&api_url).header(reqwest::header::USER_AGENT, "launchpad");
        if let Some(token) = &self.ctx.github_access_token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
        }
        let resp = req.send().await.with_context(|| format!("GET {}", api_url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("GitHub API error ({}) for {}", resp.status(), api_url).into());
        }
        let body: serde_json::Value = resp.json().await.context("decoding gist")?;
        let public = body.get("public").and_then(|v| v.as_bool()).unwrap_or(false);
        if !public && !self.ctx.allow_secret_gist {
            return Err(ProviderError::Forbidden(
                "You seem to want to use a secret Gist, but secret Gist support is not enabled on this server.".into(),
            ));
        }
        let versions: Vec<&str> = body
            .get("history")
            .and_then(|h| h.as_array())
            .map(|h| h.iter().filter_map(|e| e.get("version").and_then(|v| v.as_str())).collect())
            .unwrap_or_default();
        if self.unresolved_ref == "HEAD" || self.unresolved_ref == "master" {
            return Ok(versions.first().map(|v| v.to_string()));
        }
        Ok(versions.into_iter().find(|v| *v == self.unresolved_ref).map(str::to_string))
    }

    fn ref_url(&self, resolved_ref: &str) -> Option<String> {
        Some(format!("https://gist.github.com/{}/{}/{}", self.user, self.gist_id, resolved_ref))
    }

    fn resolved_spec(&self, resolved_ref: &str) -> String { format!("{}/{}/{}", self.user, self.gist_id, resolved_ref) }
}
