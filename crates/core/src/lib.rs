//! Launchpad core types: build progress model, caller-facing event protocol,
//! error taxonomy and the small pure helpers shared by every other crate.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub mod backoff;
pub mod error;
pub mod names;

pub use backoff::{exponential_backoff, retry, Backoff, BackoffError};
pub use error::{AdmissionError, LaunchError, LaunchResult, QuotaKind};

/// Phase of the pod backing a build job, as observed on the cluster.
/// `Deleted` is synthesized when the watch reports the object gone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Deleted,
}

impl PodPhase {
    /// Map a Kubernetes `status.phase` string. Anything unrecognised is `Unknown`.
    pub fn from_k8s(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
            PodPhase::Deleted => "Deleted",
        }
    }
}

/// Lifecycle of one build job. Only moves forward; terminal states are sticky.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BuildState {
    #[default]
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
    Deleted,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Succeeded | BuildState::Failed | BuildState::Deleted)
    }

    fn rank(self) -> u8 {
        match self {
            BuildState::Unknown => 0,
            BuildState::Pending => 1,
            BuildState::Running => 2,
            BuildState::Succeeded | BuildState::Failed | BuildState::Deleted => 3,
        }
    }

    /// Reconcile with an observed pod phase. Returns true when the state changed.
    pub fn observe(&mut self, phase: PodPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        let next = match phase {
            PodPhase::Pending => BuildState::Pending,
            PodPhase::Running => BuildState::Running,
            PodPhase::Succeeded => BuildState::Succeeded,
            PodPhase::Failed => BuildState::Failed,
            PodPhase::Deleted => BuildState::Deleted,
            PodPhase::Unknown => return false,
        };
        if next.rank() > self.rank() {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Outcome-level status reported by an executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Local builds only: the build process was killed on request.
    Terminated,
    Unknown,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Terminated)
    }
}

/// One structured line of builder output.
///
/// The builder is expected to print JSON objects carrying at least `phase`
/// and `message`. Anything else is wrapped as an `unknown`-phase message so
/// that failures stay visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine(pub Map<String, Value>);

impl LogLine {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => LogLine(map),
            _ => {
                tracing::debug!(line = %raw, "log event not json");
                let mut map = Map::new();
                map.insert("phase".into(), Value::String("unknown".into()));
                map.insert("message".into(), Value::String(format!("{}\n", raw)));
                LogLine(map)
            }
        }
    }

    pub fn phase(&self) -> Option<&str> { self.0.get("phase").and_then(|v| v.as_str()) }

    pub fn message(&self) -> Option<&str> { self.0.get("message").and_then(|v| v.as_str()) }

    pub fn is_failure(&self) -> bool { matches!(self.phase(), Some("failure") | Some("failed")) }
}

/// Progress reported by a build executor on its run's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    PodPhaseChange(PodPhase),
    LogMessage(LogLine),
    BuildStatusChange(BuildStatus),
}

/// Caller-facing event: a JSON object with at least a `phase` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "imageName", default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamEvent {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self { phase: phase.into(), message: Some(message.into()), image_name: None, url: None, token: None, extra: Map::new() }
    }

    pub fn waiting() -> Self { Self::new("waiting", "Waiting for build to start...\n") }

    pub fn built(image_name: &str, found: bool) -> Self {
        let msg = if found { "Found built image, launching...\n" } else { "Built image, launching...\n" };
        Self { image_name: Some(image_name.to_string()), ..Self::new("built", msg) }
    }

    pub fn failed(message: impl AsRef<str>) -> Self {
        let message = message.as_ref();
        if message.ends_with('\n') { Self::new("failed", message) } else { Self::new("failed", format!("{}\n", message)) }
    }

    pub fn launching(message: impl Into<String>) -> Self { Self::new("launching", message) }

    /// Build-log line forwarded verbatim (phase and message taken from the line).
    pub fn from_log(line: LogLine) -> Self {
        let mut extra = line.0;
        let phase = match extra.remove("phase") { Some(Value::String(s)) => s, _ => "unknown".to_string() };
        let message = match extra.remove("message") { Some(Value::String(s)) => Some(s), Some(other) => Some(other.to_string()), None => None };
        Self { phase, message, image_name: None, url: None, token: None, extra }
    }

    pub fn is_failed(&self) -> bool { self.phase == "failed" }

    pub fn is_terminal(&self) -> bool { matches!(self.phase.as_str(), "ready" | "failed") }
}

/// Score used for rendezvous ranking: the first 8 bytes of SHA-256 over `key-bucket`.
fn rendezvous_score(key: &str, bucket: &str) -> u64 {
    let digest = Sha256::digest(format!("{}-{}", key, bucket).as_bytes());
    let mut b = [0u8; 8];
    b.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(b)
}

/// Rank `buckets` for `key` with rendezvous (highest random weight) hashing.
/// Highest ranked first. Removing a bucket that is not the winner never
/// changes the winner.
pub fn rendezvous_rank<'a, S: AsRef<str>>(buckets: &'a [S], key: &str) -> Vec<&'a S> {
    let mut ranked: Vec<(u64, &S)> = buckets.iter().map(|b| (rendezvous_score(key, b.as_ref()), b)).collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.as_ref().cmp(a.1.as_ref())));
    ranked.into_iter().map(|(_, b)| b).collect()
}

pub mod prelude {
    pub use super::{
        BuildState, BuildStatus, LaunchError, LaunchResult, LogLine, PodPhase, ProgressEvent, StreamEvent,
    };
}
