//! DOI-addressed archives. Their refs are record versions, not commits.
//!
//! The record identity is only known after the DOI has been resolved, so
//! `build_slug` is `None` until `lookup_ref` has run.

use std::sync::{Arc, OnceLock};

use anyhow::Context;
use launchpad_core::names::escape;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::{ProviderContext, ProviderError, RepoProvider};

const DOI_PREFIXES: [&str; 5] = ["doi:", "https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/"];

/// The bare DOI if `spec` is one (`doi:` and resolver prefixes removed).
pub fn normalize_doi(spec: &str) -> Option<&str> {
    let doi = DOI_PREFIXES.iter().find_map(|p| spec.strip_prefix(p)).unwrap_or(spec);
    let (registrant, suffix) = doi.split_once('/')?;
    let valid_registrant = registrant.starts_with("10.")
        && registrant[3..].split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
    (valid_registrant && !suffix.is_empty()).then_some(doi)
}

/// Resolve a DOI to the URL it redirects to. URLs are returned unchanged.
async fn doi_to_url(ctx: &ProviderContext, spec: &str) -> Result<String, ProviderError> {
    let Some(doi) = normalize_doi(spec) else {
        return Ok(spec.to_string());
    };
    let url = format!("{}{}", ctx.doi_resolver, doi);
    debug!(url = %url, "resolving doi");
    let resp = ctx.http.get(&url).send().await.with_context(|| format!("GET {}", url))?;
    if !resp.status().is_success() {
        return Err(ProviderError::InvalidSpec(format!("Could not resolve DOI {} ({})", doi, resp.status())));
    }
    Ok(resp.url().to_string())
}

/// Path after the first matching host prefix.
fn strip_host<'a>(hosts: &[String], url: &'a str) -> Option<&'a str> {
    hosts.iter().find_map(|h| url.strip_prefix(h.as_str()))
}

fn ref_url_for(ctx: &ProviderContext, spec: &str) -> String {
    match normalize_doi(spec) {
        Some(doi) => format!("{}{}", ctx.doi_resolver, doi),
        None => spec.to_string(),
    }
}

macro_rules! doi_common {
    () => {
        fn spec(&self) -> &str { &self.spec }
        fn unresolved_ref(&self) -> &str { "" }
        fn repo_url(&self) -> String { self.spec.clone() }
        fn ref_url(&self, _resolved_ref: &str) -> Option<String> { Some(ref_url_for(&self.ctx, &self.spec)) }
    };
}

pub struct ZenodoProvider {
    spec: String,
    ctx: Arc<ProviderContext>,
    record_id: OnceLock<String>,
}

impl ZenodoProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Self { Self { spec: spec.to_string(), ctx, record_id: OnceLock::new() } }
}

#[async_trait::async_trait]
impl RepoProvider for ZenodoProvider {
    fn name(&self) -> &'static str { "Zenodo" }

    doi_common!();

    fn build_slug(&self) -> Option<String> { self.record_id.get().map(|id| format!("zenodo-{}", id)) }

    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        let url = doi_to_url(&self.ctx, &self.spec).await?;
        let rest = strip_host(&self.ctx.zenodo_hosts, &url)
            .ok_or_else(|| ProviderError::InvalidSpec(format!("{} does not point to a Zenodo record", self.spec)))?;
        let id = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if id.is_empty() {
            return Ok(None);
        }
        let _ = self.record_id.set(id.to_string());
        Ok(Some(id.to_string()))
    }
}

pub struct FigshareProvider {
    spec: String,
    ctx: Arc<ProviderContext>,
    article_id: OnceLock<String>,
}

impl FigshareProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Self { Self { spec: spec.to_string(), ctx, article_id: OnceLock::new() } }
}

/// Article id and version from the path after the host: `[title/]<id>[/<version>]`.
fn figshare_article(path: &str) -> Option<(&str, &str)> {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let segs: Vec<&str> = path.split(['?', '#']).next().unwrap_or_default().split('/').filter(|s| !s.is_empty()).collect();
    match segs.as_slice() {
        [.., id, version] if numeric(id) && numeric(version) => Some((*id, *version)),
        [.., id] if numeric(id) => Some((*id, "1")),
        _ => None,
    }
}

#[async_trait::async_trait]
impl RepoProvider for FigshareProvider {
    fn name(&self) -> &'static str { "Figshare" }

    doi_common!();

    fn build_slug(&self) -> Option<String> { self.article_id.get().map(|id| format!("figshare-{}", id)) }

    /// Ref is `<article id>.v<version>`; version defaults to 1.
    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        let url = doi_to_url(&self.ctx, &self.spec).await?;
        let rest = strip_host(&self.ctx.figshare_hosts, &url)
            .ok_or_else(|| ProviderError::InvalidSpec(format!("{} does not point to a Figshare article", self.spec)))?;
        let Some((id, version)) = figshare_article(rest) else {
            return Ok(None);
        };
        let _ = self.article_id.set(id.to_string());
        Ok(Some(format!("{}.v{}", id, version)))
    }
}

pub struct DataverseProvider {
    spec: String,
    ctx: Arc<ProviderContext>,
    identifier: OnceLock<String>,
}

impl DataverseProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Self { Self { spec: spec.to_string(), ctx, identifier: OnceLock::new() } }
}

#[async_trait::async_trait]
impl RepoProvider for DataverseProvider {
    fn name(&self) -> &'static str { "Dataverse" }

    doi_common!();

    fn build_slug(&self) -> Option<String> { self.identifier.get().map(|id| format!("dataverse-{}", escape(id).to_lowercase())) }

    /// Ref is the latest dataset version, `<major>.<minor>`.
    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        let url = doi_to_url(&self.ctx, &self.spec).await?;
        let host = self
            .ctx
            .dataverse_hosts
            .iter()
            .find(|h| url.starts_with(h.as_str()))
            .ok_or_else(|| ProviderError::InvalidSpec(format!("{} does not point to a known Dataverse installation", self.spec)))?;
        let parsed = Url::parse(&url).context("parsing dataverse url")?;
        let Some(pid) = parsed.query_pairs().find(|(k, _)| k == "persistentId").map(|(_, v)| v.into_owned()) else {
            return Ok(None);
        };
        let api_url = format!("{}/api/datasets/:persistentId", host.trim_end_matches('/'));
        debug!(url = %api_url, pid = %pid, "fetching");
        let resp = self
            .ctx
            .http
            .get(&api_url)
            .query(&[("persistentId", pid.as_str())])
            .send()
            .await
            .with_context(|| format!("GET {}", api_url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("Dataverse API error ({}) for {}", resp.status(), api_url).into());
        }
        let body: serde_json::Value = resp.json().await.context("decoding dataverse dataset")?;
        let latest = &body["data"]["latestVersion"];
        let (Some(major), Some(minor)) = (latest["versionNumber"].as_u64(), latest["versionMinorNumber"].as_u64()) else {
            return Ok(None);
        };
        let _ = self.identifier.set(pid.trim_start_matches("doi:").to_string());
        Ok(Some(format!("{}.{}", major, minor)))
    }
}

pub struct HydroshareProvider {
    spec: String,
    ctx: Arc<ProviderContext>,
    resource_id: OnceLock<String>,
}

impl HydroshareProvider {
    pub fn new(spec: &str, ctx: Arc<ProviderContext>) -> Self { Self { spec: spec.to_string(), ctx, resource_id: OnceLock::new() } }
}

/// Seconds since the epoch of a HydroShare timestamp.
pub(crate) fn parse_hydroshare_date(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|n| n.and_utc().timestamp())
}

#[async_trait::async_trait]
impl RepoProvider for HydroshareProvider {
    fn name(&self) -> &'static str { "Hydroshare" }

    doi_common!();

    fn build_slug(&self) -> Option<String> { self.resource_id.get().map(|id| format!("hydroshare-{}", id)) }

    /// Ref is the resource's last-modified time as a unix timestamp.
    async fn lookup_ref(&self) -> Result<Option<String>, ProviderError> {
        let url = doi_to_url(&self.ctx, &self.spec).await?;
        let (host, rest) = self
            .ctx
            .hydroshare_hosts
            .iter()
            .find_map(|h| url.strip_prefix(h.as_str()).map(|r| (h, r)))
            .ok_or_else(|| ProviderError::InvalidSpec(format!("{} does not point to a HydroShare resource", self.spec)))?;
        let id = rest.split(['/', '?', '#']).next().unwrap_or_default().to_string();
        if id.is_empty() {
            return Ok(None);
        }
        let api_url = format!("{}{}/scimeta/elements", host.replace("/resource/", "/hsapi/resource/"), id);
        debug!(url = %api_url, "fetching");
        let resp = self.ctx.http.get(&api_url).send().await.with_context(|| format!("GET {}", api_url))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("HydroShare API error ({}) for {}", resp.status(), api_url).into());
        }
        let body: serde_json::Value = resp.json().await.context("decoding hydroshare metadata")?;
        let modified = body["dates"]
            .as_array()
            .and_then(|dates| dates.iter().find(|d| d["type"] == "modified"))
            .and_then(|d| d["start_date"].as_str())
            .and_then(parse_hydroshare_date);
        let _ = self.resource_id.set(id);
        Ok(modified.map(|ts| ts.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doi_normalization() {
        assert_eq!(normalize_doi("10.5281/zenodo.3242074"), Some("10.5281/zenodo.3242074"));
        assert_eq!(normalize_doi("doi:10.5281/zenodo.3242074"), Some("10.5281/zenodo.3242074"));
        assert_eq!(normalize_doi("https://doi.org/10.6084/m9.figshare.9782777.v1"), Some("10.6084/m9.figshare.9782777.v1"));
        assert_eq!(normalize_doi("https://zenodo.org/record/3242074"), None);
        assert_eq!(normalize_doi("10.x/abc"), None);
    }

    #[test]
    fn figshare_article_path() {
        assert_eq!(figshare_article("title_of_article/9782777/3"), Some(("9782777", "3")));
        assert_eq!(figshare_article("title_of_article/9782777/"), Some(("9782777", "1")));
        assert_eq!(figshare_article("title_of_article"), None);
    }

    #[test]
    fn hydroshare_dates() {
        assert_eq!(parse_hydroshare_date("1970-01-01T00:01:00Z"), Some(60));
        assert_eq!(parse_hydroshare_date("1970-01-01T00:00:10.5"), Some(10));
        assert_eq!(parse_hydroshare_date("yesterday"), None);
    }

    #[tokio::test]
    async fn zenodo_url_spec_needs_no_resolver() {
        let p = ZenodoProvider::new("https://zenodo.org/record/3242074", Arc::new(ProviderContext::default()));
        assert_eq!(p.build_slug(), None);
        assert_eq!(p.lookup_ref().await.unwrap().as_deref(), Some("3242074"));
        assert_eq!(p.build_slug().as_deref(), Some("zenodo-3242074"));
        assert_eq!(p.repo_url(), "https://zenodo.org/record/3242074");
    }
}
