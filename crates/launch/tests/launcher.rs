use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use launchpad_launch::{Launch, LaunchFailure, LaunchRequest, Launcher, LauncherConfig};
use serde_json::json;

fn config(hub_url: &str) -> LauncherConfig {
    LauncherConfig {
        hub_url: hub_url.to_string(),
        hub_api_token: "hubtoken".into(),
        retries: 3,
        retry_delay: Duration::from_millis(10),
        launch_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        ..LauncherConfig::default()
    }
}

#[tokio::test]
async fn launch_creates_user_starts_server_and_waits_for_ready() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/hub/api/users/org-repo-abc").header("authorization", "token hubtoken");
            then.status(201).json_body(json!({"name": "org-repo-abc"}));
        })
        .await;
    let start = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/hub/api/users/org-repo-abc/servers/")
                .body_contains("\"image\":\"reg/org-repo:abcdef0\"")
                .body_contains("\"repo_url\":\"https://github.com/org/repo\"");
            then.status(202);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/hub/api/users/org-repo-abc");
            then.status(200).json_body(json!({"servers": {"": {"ready": true, "pending": null}}}));
        })
        .await;

    let launcher = Launcher::new(config(&server.base_url()));
    let req = LaunchRequest::new("reg/org-repo:abcdef0", "org-repo-abc", "https://github.com/org/repo");
    let info = launcher.launch(&req).await.unwrap();
    assert_eq!(info.url, format!("{}/user/org-repo-abc/", server.base_url()));
    assert_eq!(info.image, "reg/org-repo:abcdef0");
    assert_eq!(info.token.len(), 22);
    create.assert_hits_async(1).await;
    start.assert_hits_async(1).await;
}

#[tokio::test]
async fn server_errors_are_retried_then_reported() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/hub/api/users/u1");
            then.status(503);
        })
        .await;
    let launcher = Launcher::new(config(&server.base_url()));
    let err = launcher.launch(&LaunchRequest::new("img:1", "u1", "r")).await.unwrap_err();
    assert!(matches!(err, LaunchFailure::CreateUser { .. }));
    assert_eq!(err.to_string(), "Failed to create temporary user for img:1");
    create.assert_hits_async(3).await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/hub/api/users/u2");
            then.status(409);
        })
        .await;
    let launcher = Launcher::new(config(&server.base_url()));
    let err = launcher.launch(&LaunchRequest::new("img:1", "u2", "r")).await.unwrap_err();
    assert!(matches!(err, LaunchFailure::CreateUser { .. }));
    create.assert_hits_async(1).await;
}

#[tokio::test]
async fn conflict_after_a_retry_counts_as_created() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new()
        .route(
            "/hub/api/users/{name}",
            post(move || {
                let counter = counter.clone();
                async move {
                    // First attempt times out at the proxy, but the user got created.
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::BAD_GATEWAY
                    } else {
                        StatusCode::CONFLICT
                    }
                }
            })
            .get(|| async { Json(json!({"servers": {"": {"ready": true}}})) }),
        )
        .route("/hub/api/users/{name}/servers/", post(|| async { StatusCode::CREATED }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    let launcher = Launcher::new(config(&format!("http://{}", addr)));
    let info = launcher.launch(&LaunchRequest::new("img:1", "u3", "r")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(info.url.ends_with("/user/u3/"));
}

#[tokio::test]
async fn server_that_never_gets_ready_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path_contains("/hub/api/users/u4");
            then.status(201);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/hub/api/users/u4");
            then.status(200).json_body(json!({"servers": {"": {"ready": false, "pending": "spawn"}}}));
        })
        .await;
    let launcher = Launcher::new(LauncherConfig { launch_timeout: Duration::from_millis(300), ..config(&server.base_url()) });
    let err = launcher.launch(&LaunchRequest::new("img:1", "u4", "r")).await.unwrap_err();
    assert!(matches!(err, LaunchFailure::Timeout { .. }), "{err:?}");
    assert_eq!(err.to_string(), "Image img:1 for user u4 took too long to launch");
}

#[tokio::test]
async fn server_that_stops_while_starting_fails() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path_contains("/hub/api/users/u5");
            then.status(201);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/hub/api/users/u5");
            then.status(200).json_body(json!({"servers": {}}));
        })
        .await;
    let launcher = Launcher::new(config(&server.base_url()));
    let err = launcher.launch(&LaunchRequest::new("img:1", "u5", "r")).await.unwrap_err();
    assert!(matches!(err, LaunchFailure::Failed { .. }), "{err:?}");
}

#[tokio::test]
async fn authenticated_user_with_a_running_server_is_refused() {
    let server = MockServer::start_async().await;
    let start = server
        .mock_async(|when, then| {
            when.method(POST).path_contains("/servers/");
            then.status(201);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/hub/api/users/me@example.org");
            then.status(200).json_body(json!({"servers": {"": {"ready": true}}}));
        })
        .await;
    let cfg = LauncherConfig { create_user: false, ..config(&server.base_url()) };
    let err = Launcher::new(cfg).launch(&LaunchRequest::new("img:1", "me@example.org", "r")).await.unwrap_err();
    assert!(matches!(err, LaunchFailure::ServerExists { .. }));
    start.assert_hits_async(0).await;
}

#[tokio::test]
async fn named_server_limit_is_enforced() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/hub/api/users/me");
            then.status(200).json_body(json!({"servers": {"": {}, "a": {}, "b": {}}}));
        })
        .await;
    let cfg = LauncherConfig { create_user: false, named_server_limit_per_user: 2, ..config(&server.base_url()) };
    let req = LaunchRequest::new("img:1", "me", "r").with_server_name("c");
    match Launcher::new(cfg).launch(&req).await.unwrap_err() {
        LaunchFailure::NamedServerLimit { limit, .. } => assert_eq!(limit, 2),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn ping_hits_the_hub_health_endpoint() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET).path("/hub/health");
            then.status(200);
        })
        .await;
    Launcher::new(config(&server.base_url())).ping().await.unwrap();
    health.assert_hits_async(1).await;

    let sick = MockServer::start_async().await;
    sick.mock_async(|when, then| {
        when.method(GET).path("/hub/health");
        then.status(502);
    })
    .await;
    let err = Launcher::new(config(&sick.base_url())).ping().await.unwrap_err();
    assert!(format!("{err:#}").contains("/hub/health"), "{err:#}");
}
