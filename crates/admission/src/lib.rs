//! Launchpad admission control.
//!
//! Two gates run before a build or launch: a per-key fixed-window rate limit
//! (in-process, or delegated to a shared endpoint) and a pod quota computed
//! from the session pods currently on the cluster.

#![forbid(unsafe_code)]

mod endpoint;
mod quota;
mod ratelimit;
mod remote;

pub use endpoint::{bearer_token, router, serve, tokens_from_env, EndpointState};
pub use quota::{QuotaChecker, QuotaSnapshot, SESSION_POD_SELECTOR};
pub use ratelimit::{RateLimit, RateLimitStatus, RateLimiter, DEFAULT_CLEAN_SECONDS, DEFAULT_LIMIT, DEFAULT_PERIOD_SECONDS};
pub use remote::RemoteRateLimiter;
