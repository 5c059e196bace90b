//! Error taxonomy surfaced to callers of the orchestrator.

use serde::{Deserialize, Serialize};

/// Which quota an admission check tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    PodQuota,
    RepoQuota,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::PodQuota => "pod_quota",
            QuotaKind::RepoQuota => "repo_quota",
        }
    }
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Admission control refused the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum AdmissionError {
    #[error("Rate limit exceeded (by {deficit}) for {key:?}, reset in {reset_in}s.")]
    RateLimited { key: String, limit: i64, deficit: i64, reset_in: i64 },
    #[error("{message}")]
    Quota { status: QuotaKind, quota: u64, used: u64, message: String },
}

impl AdmissionError {
    pub fn quota(status: QuotaKind, quota: u64, used: u64, message: impl Into<String>) -> Self {
        AdmissionError::Quota { status, quota, used, message: message.into() }
    }
}

/// Errors a build-and-launch run can end with.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Malformed or refused spec; reported verbatim.
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("registry protocol error: {0}")]
    RegistryProtocol(String),
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    /// Local builds only: the build process was killed on request.
    #[error("build process terminated")]
    ProcessTerminated,
    #[error("internal: {0}")]
    Internal(String),
}

pub type LaunchResult<T> = Result<T, LaunchError>;

impl From<anyhow::Error> for LaunchError {
    fn from(e: anyhow::Error) -> Self { LaunchError::Internal(format!("{:#}", e)) }
}
