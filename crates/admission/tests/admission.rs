use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use k8s_openapi::api::core::v1::Pod;
use launchpad_admission::{router, EndpointState, QuotaChecker, RateLimit, RemoteRateLimiter};
use launchpad_core::{AdmissionError, LaunchError, QuotaKind};
use launchpad_kubehub::MemoryCluster;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn post(app: &axum::Router, path: &str, auth: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method("POST").uri(path);
    if let Some(a) = auth {
        builder = builder.header("Authorization", a);
    }
    let body = match body {
        Some(b) => Body::from(b.to_string()),
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn app(limit: i64) -> axum::Router { router(EndpointState::with_default_limiters(vec!["secret".to_string()], limit, 3600, 600)) }

#[tokio::test]
async fn endpoint_requires_a_known_token() {
    let app = app(2);
    assert_eq!(post(&app, "/repo/gh/org/repo", None, None).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(post(&app, "/repo/gh/org/repo", Some("token wrong"), None).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(post(&app, "/repo/gh/org/repo", Some("Bearer secret"), None).await.0, StatusCode::OK);
}

#[tokio::test]
async fn endpoint_counts_down_and_rejects() {
    let app = app(2);
    let (status, body) = post(&app, "/request/1.2.3.4", Some("token secret"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"]["remaining"], 1);
    assert_eq!(body["limit"]["limit"], 2);
    assert!(body["limit"]["reset_in"].as_i64().unwrap() > 3500);
    post(&app, "/request/1.2.3.4", Some("token secret"), None).await;
    let (status, body) = post(&app, "/request/1.2.3.4", Some("token secret"), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["message"].as_str().unwrap().starts_with("Rate limit exceeded (by 1)"));
}

#[tokio::test]
async fn endpoint_validates_body_and_limiter() {
    let app = app(2);
    let (status, _) = post(&app, "/nope/key", Some("token secret"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = post(&app, "/repo/key", Some("token secret"), Some(json!({"limit": "ten"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("limit must be null or a number"));
    let (status, body) = post(&app, "/repo/key", Some("token secret"), Some(json!({"limit": 5}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"]["remaining"], 4);
}

#[tokio::test]
async fn zero_limit_is_unlimited() {
    let app = app(0);
    for _ in 0..5 {
        let (status, body) = post(&app, "/repo/key", Some("token secret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], json!({"limit": 0, "remaining": 0, "reset": 0, "reset_in": 0}));
    }
}

#[tokio::test]
async fn remote_limiter_maps_responses() {
    let server = MockServer::start_async().await;
    let ok = server
        .mock_async(|when, then| {
            when.method(POST).path("/repo/gh/org/ok").header("authorization", "token secret");
            then.status(200).json_body(json!({"limit": {"limit": 10, "remaining": 9, "reset": 100, "reset_in": 50}}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/repo/gh/org/busy");
            then.status(429).json_body(json!({"message": "Rate limit exceeded (by 3)", "limit": {"limit": 10, "remaining": -3, "reset_in": 20}}));
        })
        .await;
    let rl = RemoteRateLimiter::new(&server.base_url(), "secret", "repo");
    let s = rl.increment("gh/org/ok").await.unwrap();
    assert_eq!(s.remaining, 9);
    ok.assert_hits_async(1).await;
    match rl.increment("gh/org/busy").await.unwrap_err() {
        LaunchError::Admission(AdmissionError::RateLimited { deficit, reset_in, .. }) => {
            assert_eq!(deficit, 3);
            assert_eq!(reset_in, 20);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn remote_limiter_keeps_reserved_characters_in_the_key() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app(2)).await });
    let rl = RemoteRateLimiter::new(&format!("http://{addr}"), "secret", "request");
    assert_eq!(rl.increment("gh/org/a b?c#d").await.unwrap().remaining, 1);
    assert_eq!(rl.increment("gh/org/a b?c#d").await.unwrap().remaining, 0);
    assert_eq!(rl.increment("gh/org/a b").await.unwrap().remaining, 1);
    assert_eq!(rl.increment("gh/org/a%20b").await.unwrap().remaining, 1);
}

fn session_pod(name: &str, image: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": {"name": name, "labels": {"app": "jupyterhub", "component": "singleuser-server"}},
        "spec": {"containers": [{"name": "notebook", "image": image}]}
    }))
    .unwrap()
}

#[tokio::test]
async fn pod_quota_is_checked_first() {
    let cluster = MemoryCluster::default();
    for i in 0..3 {
        cluster.insert_pod("ns", session_pod(&format!("jupyter-{i}"), "reg/org-repo:abc"));
    }
    let checker = QuotaChecker::new(Arc::new(cluster), "ns", Some(3));
    match checker.check_repo_quota("reg/org-repo:def", Some(1), "https://github.com/org/repo").await.unwrap_err() {
        LaunchError::Admission(AdmissionError::Quota { status, quota, used, .. }) => {
            assert_eq!(status, QuotaKind::PodQuota);
            assert_eq!((quota, used), (3, 3));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn repo_quota_counts_same_image_any_tag() {
    let cluster = MemoryCluster::default();
    cluster.insert_pod("ns", session_pod("a", "reg/org-repo:abc"));
    cluster.insert_pod("ns", session_pod("b", "reg/org-repo:old"));
    cluster.insert_pod("ns", session_pod("c", "reg/other:abc"));
    let checker = QuotaChecker::new(Arc::new(cluster), "ns", Some(10));
    let snap = checker.check_repo_quota("reg/org-repo:abc", Some(3), "u").await.unwrap().unwrap();
    assert_eq!((snap.total, snap.matching, snap.quota), (3, 2, Some(3)));
    match checker.check_repo_quota("reg/org-repo:abc", Some(2), "u").await.unwrap_err() {
        LaunchError::Admission(AdmissionError::Quota { status, used, .. }) => {
            assert_eq!(status, QuotaKind::RepoQuota);
            assert_eq!(used, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn no_quota_means_no_check() {
    let cluster = MemoryCluster::default();
    for i in 0..50 {
        cluster.insert_pod("ns", session_pod(&format!("p{i}"), "reg/x:y"));
    }
    let checker = QuotaChecker::new(Arc::new(cluster), "ns", None);
    assert_eq!(checker.check_repo_quota("reg/x:y", None, "u").await.unwrap(), None);
    assert_eq!(checker.check_repo_quota("reg/x:y", Some(0), "u").await.unwrap(), None);
}
