use std::sync::Arc;

use anyhow::Context;
use metrics::gauge;
use reqwest::{header::HeaderMap, StatusCode};
use tracing::{debug, error, info, warn};

use crate::{is_sha1, strip_suffix, tokenize_spec, ProviderContext, ProviderError, RepoProvider};

pub struct GitHubProvider {
    spec: String,
    user: String,
    repo: String,
    unresolved_ref: String,
    ctx: Arc<ProviderContext>,
}

impl GitHubProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Result<Self, ProviderError> {
        let (user, repo, unresolved_ref) = tokenize_spec(spec)?;
        let repo = strip_suffix(&repo, ".git").to_string();
        Ok(Self { spec: spec.to_string(), user, repo, unresolved_ref, ctx })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.ctx.http.get(url).header(reqwest::header::USER_AGENT, "launchpad");
        if let Some(token) = &self.ctx.github_access_token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
        } else if let (Some(id), Some(secret)) = (&self.ctx.github_client_id, &self.ctx.github_client_secret) {
            req = req.query(&[("client_id", id.as_str()), ("client_secret", secret.as_str())]);
        }
        req
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.trim().parse().ok())
}

fn seconds_until(reset_timestamp: i64) -> i64 { reset_timestamp - chrono::Utc::now().timestamp() }

/// Minutes until reset, rounded up to the next multiple of five.
pub(crate) fn minutes_until_reset(reset_seconds: i64) -> i64 { 5 * (1 + reset_seconds.max(0) / 60 / 5) }

/// Record remaining API budget and log louder as it runs out.
fn record_rate_limit(headers: &HeaderMap) {
    let (Some(remaining), Some(limit)) = (header_i64(headers, "x-ratelimit-remaining"), header_i64(headers, "x-ratelimit-limit")) else {
        return;
    };
    gauge!("github_rate_limit_remaining", remaining as f64);
    let reset_in = header_i64(headers, "x-ratelimit-reset").map(seconds_until).unwrap_or_default();
    let fraction = if limit > 0 { remaining as f64 / limit as f64 } else { 0.0 };
    if fraction < 0.2 {
        warn!(remaining, limit, reset_in, "GitHub rate limit running low");
    } else if fraction < 0.5 {
        info!(remaining, limit, reset_in, "GitHub rate limit");
    } else {
        debug!(remaining, limit, reset_in, "GitHub rate limit");
    }
}

#[async_trait::async_trait]
impl RepoProvider for GitHubProvider {
    fn name(&self) -> &'static str { "GitHub" }

    fn spec(&self) -> &str { &self.spec }

    fn unresolved_ref(&self) -> &str { &self.unresolved_ref }

    fn repo_url(&self) -> String { format!("https://github.com/{}/{}", self.user, self.repo) }

    fn build_slug(&self) -> Option<String> { Some(format!("{}-{}", self.user, self.repo)) }

    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        if is_sha1(&self.unresolved_ref) {
            return Ok(Some(self.unresolved_ref.clone()));
        }
        let api_url = format!(
            "{}/repos/{}/{}/commits/{}",
            self.ctx.github_api_url.trim_end_matches('/'),
            self.user,
            self.repo,
            self.unresolved_ref
        );
        debug!(url = %api_url, "fetching");
        let resp = self.request(&api_url).send().await.with_context(|| format!("GET {}", api_url))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        if status == StatusCode::FORBIDDEN && header_i64(&headers, "x-ratelimit-remaining") == Some(0) {
            let reset_in = header_i64(&headers, "x-ratelimit-reset").map(seconds_until).unwrap_or_default();
            error!(limit = ?header_i64(&headers, "x-ratelimit-limit"), reset_in, "GitHub rate limit exceeded");
            return Err(ProviderError::RateLimited(format!(
                "GitHub rate limit exceeded. Try again in {} minutes.",
                minutes_until_reset(reset_in)
            )));
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow::anyhow!("GitHub API error ({}) for {}", status, api_url).into());
        }
        record_rate_limit(&headers);
        let body: serde_json::Value = resp.json().await.context("decoding GitHub commit")?;
        Ok(body.get("sha").and_then(|s| s.as_str()).map(str::to_string))
    }

    fn ref_url(&self, resolved_ref: &str) -> Option<String> {
        Some(format!("https://github.com/{}/{}/tree/{}", self.user, self.repo, resolved_ref))
    }

    fn resolved_spec(&self, resolved_ref: &str) -> String { format!("{}/{}/{}", self.user, self.repo, resolved_ref) }

    fn git_credentials(&self) -> Option<String> {
        self.ctx.github_access_token.as_ref().map(|t| format!("username={}\\npassword=x-oauth-basic", t))
    }
}
