use anyhow::Context;
use launchpad_core::{AdmissionError, LaunchError, LaunchResult};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{RateLimit, RateLimitStatus};

/// Key bytes escaped in the request path; `/` stays, the endpoint takes the rest of the path.
const KEY_PATH: &AsciiSet = &NON_ALPHANUMERIC.remove(b'/').remove(b'_').remove(b'.').remove(b'-').remove(b'~');

/// Client for the shared endpoint served by [`crate::router`].
pub struct RemoteRateLimiter {
    http: reqwest::Client,
    base_url: String,
    token: String,
    which: String,
    initial_limit: Option<i64>,
}

#[derive(Deserialize)]
struct LimitBody {
    limit: RateLimitStatus,
}

#[derive(Deserialize)]
struct ExceededBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    limit: Option<ExceededLimit>,
}

#[derive(Deserialize)]
struct ExceededLimit {
    limit: i64,
    remaining: i64,
    reset_in: i64,
}

impl RemoteRateLimiter {
    pub fn new(base_url: &str, token: &str, which: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            which: which.to_string(),
            initial_limit: None,
        }
    }

    pub fn with_initial_limit(mut self, limit: Option<i64>) -> Self {
        self.initial_limit = limit;
        self
    }
}

#[async_trait::async_trait]
impl RateLimit for RemoteRateLimiter {
    async fn increment(&self, key: &str) -> LaunchResult<RateLimitStatus> {
        let url = format!("{}/{}/{}", self.base_url, self.which, utf8_percent_encode(key, KEY_PATH));
        debug!(url = %url, "incrementing remote rate limit");
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
            .json(&json!({ "limit": self.initial_limit }))
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        match resp.status() {
            s if s.is_success() => {
                let body: LimitBody = resp.json().await.context("decoding rate limit response")?;
                Ok(body.limit)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let body: ExceededBody = resp.json().await.context("decoding rate limit response")?;
                let (limit, deficit, reset_in) = body.limit.map(|l| (l.limit, -l.remaining, l.reset_in)).unwrap_or_default();
                debug!(key, message = %body.message, "remote rate limit exceeded");
                Err(AdmissionError::RateLimited { key: key.to_string(), limit, deficit, reset_in }.into())
            }
            s => Err(LaunchError::Internal(format!("rate limit endpoint returned {} for {}", s, url))),
        }
    }
}
