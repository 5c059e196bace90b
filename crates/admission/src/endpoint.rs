//! Shared rate-limit endpoint: `POST /{which}/{key}` counts one attempt on the
//! named limiter so that several orchestrator processes share one window.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use launchpad_core::AdmissionError;
use serde_json::json;
use tracing::{debug, info};

use crate::{RateLimitStatus, RateLimiter};

#[derive(Clone)]
pub struct EndpointState {
    tokens: Arc<BTreeSet<String>>,
    limiters: Arc<BTreeMap<String, Arc<RateLimiter>>>,
}

impl EndpointState {
    pub fn new(tokens: impl IntoIterator<Item = String>, limiters: BTreeMap<String, Arc<RateLimiter>>) -> Self {
        Self { tokens: Arc::new(tokens.into_iter().filter(|t| !t.is_empty()).collect()), limiters: Arc::new(limiters) }
    }

    /// `repo` and `request` limiters sharing one configuration.
    pub fn with_default_limiters(tokens: impl IntoIterator<Item = String>, limit: i64, period_seconds: i64, clean_seconds: i64) -> Self {
        let limiters = ["repo", "request"]
            .into_iter()
            .map(|w| (w.to_string(), Arc::new(RateLimiter::new(limit, period_seconds, clean_seconds))))
            .collect();
        Self::new(tokens, limiters)
    }

    pub fn has_tokens(&self) -> bool { !self.tokens.is_empty() }
}

/// `;`-separated tokens from `RATE_LIMIT_TOKENS`.
pub fn tokens_from_env() -> Vec<String> {
    std::env::var("RATE_LIMIT_TOKENS")
        .unwrap_or_default()
        .trim()
        .split(';')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Token from `Authorization: token <t>` or `Authorization: bearer <t>`.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.trim().split_once(char::is_whitespace)?;
    let token = rest.trim_start();
    let scheme_ok = scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer");
    (scheme_ok && !token.is_empty() && !token.contains(char::is_whitespace)).then_some(token)
}

#[derive(Debug)]
enum EndpointError {
    Unauthorized,
    BadRequest(String),
    NoSuchLimit(String),
    Exceeded(AdmissionError),
}

impl IntoResponse for EndpointError {
    fn into_response(self) -> Response {
        match self {
            EndpointError::Unauthorized => (StatusCode::UNAUTHORIZED, Json(json!({"message": "Unauthorized"}))).into_response(),
            EndpointError::BadRequest(m) => (StatusCode::BAD_REQUEST, Json(json!({"message": m}))).into_response(),
            EndpointError::NoSuchLimit(w) => {
                (StatusCode::NOT_FOUND, Json(json!({"message": format!("No such rate limit: {}", w)}))).into_response()
            }
            EndpointError::Exceeded(e) => {
                let mut body = json!({"message": e.to_string()});
                if let AdmissionError::RateLimited { limit, deficit, reset_in, .. } = &e {
                    body["limit"] = json!({"limit": limit, "remaining": -deficit, "reset_in": reset_in});
                }
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
            }
        }
    }
}

pub fn router(state: EndpointState) -> Router {
    Router::new().route("/{which}/{*key}", post(increment)).with_state(state)
}

async fn increment(
    State(state): State<EndpointState>,
    Path((which, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, EndpointError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(EndpointError::Unauthorized)?;
    if !state.tokens.contains(token) {
        return Err(EndpointError::Unauthorized);
    }
    let initial_limit = parse_initial_limit(&body)?;
    let limiter = state.limiters.get(&which).ok_or_else(|| EndpointError::NoSuchLimit(which.clone()))?;
    if limiter.limit() == 0 {
        let unlimited = RateLimitStatus { limit: 0, remaining: 0, reset: 0, reset_in: 0 };
        return Ok(Json(json!({ "limit": unlimited })));
    }
    let status = limiter.increment_now(&key, initial_limit).map_err(EndpointError::Exceeded)?;
    debug!(which = %which, key = %key, remaining = status.remaining, "rate limit incremented");
    Ok(Json(json!({ "limit": status })))
}

fn parse_initial_limit(body: &[u8]) -> Result<Option<i64>, EndpointError> {
    if body.is_empty() {
        return Ok(None);
    }
    let raw = String::from_utf8_lossy(body);
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| EndpointError::BadRequest(format!("Rate limit body must be a dict with a 'limit' key, got {}", raw)))?;
    let Some(obj) = parsed.as_object() else {
        return Err(EndpointError::BadRequest(format!("Rate limit body must be a dict with a 'limit' key, got {}", raw)));
    };
    match obj.get("limit") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| EndpointError::BadRequest(format!("limit must be null or a number, not {}", v))),
    }
}

/// Serve the endpoint until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: EndpointState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    anyhow::ensure!(state.has_tokens(), "Need to set $RATE_LIMIT_TOKENS");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "rate limiter listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
