use std::sync::Arc;

use anyhow::Context;
use reqwest::StatusCode;
use tracing::debug;

use crate::{is_sha1, quote, unquote, ProviderContext, ProviderError, RepoProvider};

/// Spec is `<url-encoded namespace>/<url-encoded ref>`.
pub struct GitLabProvider {
    spec: String,
    namespace: String,
    unresolved_ref: String,
    ctx: Arc<ProviderContext>,
}

impl GitLabProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Result<Self, ProviderError> {
        let (quoted_ns, quoted_ref) = spec.split_once('/').ok_or_else(|| {
            ProviderError::InvalidSpec(format!(
                "Spec is not of the form \"<url-encoded namespace>/<ref>\", provided: \"{}\".",
                spec
            ))
        })?;
        let namespace = unquote(quoted_ns);
        let unresolved_ref = unquote(quoted_ref);
        if namespace.is_empty() || unresolved_ref.is_empty() {
            return Err(ProviderError::InvalidSpec(format!("Incomplete GitLab spec: \"{}\".", spec)));
        }
        Ok(Self { spec: spec.to_string(), namespace, unresolved_ref, ctx })
    }

    fn base(&self) -> &str { self.ctx.gitlab_url.trim_end_matches('/') }
}

#[async_trait::async_trait]
impl RepoProvider for GitLabProvider {
    fn name(&self) -> &'static str { "GitLab" }

    fn spec(&self) -> &str { &self.spec }

    fn unresolved_ref(&self) -> &str { &self.unresolved_ref }

    fn repo_url(&self) -> String { format!("{}/{}.git", self.base(), self.namespace) }

    /// Path parts joined with `-`, each `-` escaped as `_-` so joins stay unambiguous.
    fn build_slug(&self) -> Option<String> {
        Some(self.namespace.split('/').map(|p| p.replace('-', "_-")).collect::<Vec<_>>().join("-"))
    }

    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        if is_sha1(&self.unresolved_ref) {
            return Ok(Some(self.unresolved_ref.clone()));
        }
        let api_url = format!(
            "{}/api/v4/projects/{}/repository/commits/{}",
            self.base(),
            quote(&self.namespace),
            quote(&self.unresolved_ref)
        );
        debug!(url = %api_url, "fetching");
        let mut req = self.ctx.http.get(&api_url).header(reqwest::header::USER_AGENT, "launchpad");
        if let Some(t) = &self.ctx.gitlab_private_token {
            req = req.query(&[("private_token", t.as_str())]);
        }
        if let Some(t) = &self.ctx.gitlab_access_token {
            req = req.query(&[("access_token", t.as_str())]);
        }
        let resp = req.send().await.with_context(|| format!("GET {}", api_url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("GitLab API error ({}) for {}", resp.status(), api_url).into());
        }
        let body: serde_json::Value = resp.json().await.context("decoding GitLab commit")?;
        Ok(body.get("id").and_then(|s| s.as_str()).map(str::to_string))
    }

    fn ref_url(&self, resolved_ref: &str) -> Option<String> {
        Some(format!("{}/{}/tree/{}", self.base(), self.namespace, resolved_ref))
    }

    fn resolved_spec(&self, resolved_ref: &str) -> String { format!("{}/{}", quote(&self.namespace), resolved_ref) }

    fn git_credentials(&self) -> Option<String> {
        if let Some(t) = &self.ctx.gitlab_private_token {
            return Some(format!("username=launchpad\\npassword={}", t));
        }
        self.ctx.gitlab_access_token.as_ref().map(|t| format!("username=oauth2\\npassword={}", t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_escapes_dashes() {
        let p = GitLabProvider::new("gitlab-org%2Fgitlab-ce/v10.0.6", Arc::new(ProviderContext::default())).unwrap();
        assert_eq!(p.build_slug().as_deref(), Some("gitlab_-org-gitlab_-ce"));
        assert_eq!(p.repo_url(), "https://gitlab.com/gitlab-org/gitlab-ce.git");
        assert_eq!(p.unresolved_ref(), "v10.0.6");
        assert_eq!(p.resolved_spec("b3344b7"), "gitlab-org%2Fgitlab-ce/b3344b7");
    }

    #[test]
    fn spec_without_ref_is_invalid() {
        assert!(GitLabProvider::new("gitlab-org%2Fgitlab-ce", Arc::new(ProviderContext::default())).is_err());
    }
}
