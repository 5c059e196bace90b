use httpmock::Method::GET;
use httpmock::MockServer;
use launchpad_repo::{ProviderContext, ProviderError, ProviderRegistry};
use serde_json::json;

fn registry(server: &MockServer) -> ProviderRegistry {
    let base = server.base_url();
    ProviderRegistry::with_defaults(ProviderContext {
        github_api_url: base.clone(),
        gitlab_url: base.clone(),
        doi_resolver: format!("{}/doi/", base),
        zenodo_hosts: vec![format!("{}/record/", base)],
        figshare_hosts: vec![format!("{}/articles/", base)],
        dataverse_hosts: vec![base.clone()],
        hydroshare_hosts: vec![format!("{}/resource/", base)],
        ..ProviderContext::default()
    })
}

#[tokio::test]
async fn github_resolution_is_memoized() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/org/repo/commits/main");
            then.status(200)
                .header("x-ratelimit-remaining", "4000")
                .header("x-ratelimit-limit", "5000")
                .header("x-ratelimit-reset", "0")
                .json_body(json!({"sha": "abcdef0123456789abcdef0123456789abcdef01"}));
        })
        .await;
    let spec = registry(&server).spec("gh", "org/repo/main").unwrap();
    for _ in 0..3 {
        assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("abcdef0123456789abcdef0123456789abcdef01"));
    }
    m.assert_hits_async(1).await;
}

#[tokio::test]
async fn github_slug_ignores_ref() {
    let server = MockServer::start_async().await;
    let reg = registry(&server);
    let a = reg.spec("gh", "org/repo/main").unwrap().build_slug().unwrap();
    let b = reg.spec("gh", "org/repo/v1.0").unwrap().build_slug().unwrap();
    let c = reg.spec("gh", "org/other/main").unwrap().build_slug().unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[tokio::test]
async fn github_missing_ref_is_none() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/org/repo/commits/nope");
            then.status(404).json_body(json!({"message": "Not Found"}));
        })
        .await;
    let spec = registry(&server).spec("gh", "org/repo/nope").unwrap();
    assert_eq!(spec.resolved_ref().await.unwrap(), None);
}

#[tokio::test]
async fn github_rate_limit_is_reported() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/org/repo/commits/main");
            then.status(403)
                .header("x-ratelimit-remaining", "0")
                .header("x-ratelimit-limit", "60")
                .header("x-ratelimit-reset", "0");
        })
        .await;
    let spec = registry(&server).spec("gh", "org/repo/main").unwrap();
    let err = spec.resolved_ref().await.unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited(_)));
    assert_eq!(err.to_string(), "GitHub rate limit exceeded. Try again in 5 minutes.");
}

#[tokio::test]
async fn github_sha_skips_lookup() {
    let server = MockServer::start_async().await;
    let m = server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(500);
        })
        .await;
    let sha = "f7f3ff6d1bf708bdc12e5f10e18b2a90a4795603";
    let spec = registry(&server).spec("gh", &format!("org/repo/{}", sha)).unwrap();
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some(sha));
    m.assert_hits_async(0).await;
}

#[tokio::test]
async fn gitlab_resolves_commit_id() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/repository/commits/v10.0.6");
            then.status(200).json_body(json!({"id": "b3344b7f17c335a817c5d7608c5e47fd7cabc023"}));
        })
        .await;
    let spec = registry(&server).spec("gl", "gitlab-org%2Fgitlab-ce/v10.0.6").unwrap();
    assert_eq!(spec.build_slug().unwrap(), "gitlab_-org-gitlab_-ce");
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("b3344b7f17c335a817c5d7608c5e47fd7cabc023"));
}

#[tokio::test]
async fn secret_gist_needs_opt_in() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gists/bd01411ea4bf4eb8135893ef237398ba");
            then.status(200).json_body(json!({"public": false, "history": [{"version": "7daa381aae8409bfe28193e2ed8f767c26371237"}]}));
        })
        .await;
    let reg = registry(&server);
    let spec = reg.spec("gist", "someone/bd01411ea4bf4eb8135893ef237398ba").unwrap();
    assert!(matches!(spec.resolved_ref().await.unwrap_err(), ProviderError::Forbidden(_)));

    let mut ctx = reg.context().clone();
    ctx.allow_secret_gist = true;
    let spec = ProviderRegistry::with_defaults(ctx).spec("gist", "someone/bd01411ea4bf4eb8135893ef237398ba").unwrap();
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("7daa381aae8409bfe28193e2ed8f767c26371237"));
}

#[tokio::test]
async fn zenodo_doi_follows_redirect() {
    let server = MockServer::start_async().await;
    let target = format!("{}/record/3242074", server.base_url());
    server
        .mock_async(|when, then| {
            when.method(GET).path("/doi/10.5281/zenodo.3242074");
            then.status(302).header("Location", target.as_str());
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/record/3242074");
            then.status(200).body("<html></html>");
        })
        .await;
    let spec = registry(&server).spec("zenodo", "10.5281/zenodo.3242074").unwrap();
    assert!(matches!(spec.build_slug(), Err(ProviderError::Unresolved(_))));
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("3242074"));
    assert_eq!(spec.build_slug().unwrap(), "zenodo-3242074");
    assert_eq!(spec.repo_url(), "10.5281/zenodo.3242074");
}

#[tokio::test]
async fn figshare_ref_carries_version() {
    let server = MockServer::start_async().await;
    let target = format!("{}/articles/title/9782777/2", server.base_url());
    server
        .mock_async(|when, then| {
            when.method(GET).path("/doi/10.6084/m9.figshare.9782777.v2");
            then.status(302).header("Location", target.as_str());
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/articles/title/9782777/2");
            then.status(200);
        })
        .await;
    let spec = registry(&server).spec("figshare", "10.6084/m9.figshare.9782777.v2").unwrap();
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("9782777.v2"));
    assert_eq!(spec.build_slug().unwrap(), "figshare-9782777");
}

#[tokio::test]
async fn dataverse_ref_is_latest_version() {
    let server = MockServer::start_async().await;
    let dataset = format!("{}/dataset.xhtml?persistentId=doi:10.7910/DVN/TJCLKP", server.base_url());
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/datasets/:persistentId").query_param("persistentId", "doi:10.7910/DVN/TJCLKP");
            then.status(200).json_body(json!({"data": {"latestVersion": {"versionNumber": 3, "versionMinorNumber": 0}}}));
        })
        .await;
    let spec = registry(&server).spec("dataverse", &dataset).unwrap();
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("3.0"));
    assert_eq!(spec.build_slug().unwrap(), "dataverse-10-2e7910-2fdvn-2ftjclkp");
}

#[tokio::test]
async fn hydroshare_ref_is_modification_time() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/hsapi/resource/b8f6eae9d89241cf8b5904033460af61/scimeta/elements");
            then.status(200).json_body(json!({"dates": [
                {"type": "created", "start_date": "1970-01-01T00:00:00Z"},
                {"type": "modified", "start_date": "1970-01-01T00:10:00Z"}
            ]}));
        })
        .await;
    let url = format!("{}/resource/b8f6eae9d89241cf8b5904033460af61", server.base_url());
    let spec = registry(&server).spec("hydroshare", &url).unwrap();
    assert_eq!(spec.resolved_ref().await.unwrap().as_deref(), Some("600"));
    assert_eq!(spec.build_slug().unwrap(), "hydroshare-b8f6eae9d89241cf8b5904033460af61");
}
