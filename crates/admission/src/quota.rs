use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use launchpad_core::{names, AdmissionError, LaunchResult, QuotaKind};
use launchpad_kubehub::ClusterApi;
use metrics::counter;
use tracing::{debug, error};

/// Label selector of user session pods.
pub const SESSION_POD_SELECTOR: &str = "app=jupyterhub,component=singleuser-server";

/// Pod counts observed by one quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub total: u64,
    pub matching: u64,
    pub quota: Option<u64>,
}

pub struct QuotaChecker {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    total_quota: Option<u64>,
}

fn runs_image(pod: &Pod, image_no_tag: &str) -> bool {
    pod.spec.as_ref().is_some_and(|spec| {
        spec.containers
            .iter()
            .filter_map(|c| c.image.as_deref())
            .any(|image| names::image_without_tag(image) == image_no_tag)
    })
}

impl QuotaChecker {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, total_quota: Option<u64>) -> Self {
        Self { cluster, namespace: namespace.to_string(), total_quota }
    }

    /// Refuse a launch of `image_name` when the cluster-wide pod quota or the
    /// per-repository quota is used up. Returns `None` when neither is set.
    pub async fn check_repo_quota(&self, image_name: &str, repo_quota: Option<u64>, repo_url: &str) -> LaunchResult<Option<QuotaSnapshot>> {
        let repo_quota = repo_quota.filter(|q| *q > 0);
        if self.total_quota.is_none() && repo_quota.is_none() {
            return Ok(None);
        }
        let pods = self.cluster.list_pods(&self.namespace, SESSION_POD_SELECTOR).await?;
        let total = pods.len() as u64;
        if let Some(pod_quota) = self.total_quota {
            if total >= pod_quota {
                error!(total, quota = pod_quota, "pod quota reached");
                counter!("quota_exceeded", 1, "status" => QuotaKind::PodQuota.as_str());
                return Err(AdmissionError::quota(QuotaKind::PodQuota, pod_quota, total, "Too many users on this server! Try again soon.").into());
            }
        }
        let image_no_tag = names::image_without_tag(image_name);
        let matching = pods.iter().filter(|p| runs_image(p, image_no_tag)).count() as u64;
        if let Some(quota) = repo_quota {
            if matching >= quota {
                error!(repo = %repo_url, matching, quota, total, "repo quota reached");
                counter!("quota_exceeded", 1, "status" => QuotaKind::RepoQuota.as_str());
                return Err(AdmissionError::quota(
                    QuotaKind::RepoQuota,
                    quota,
                    matching,
                    format!("Too many users running {}! Try again soon.", repo_url),
                )
                .into());
            }
        }
        debug!(image = %image_name, total, matching, "quota check passed");
        Ok(Some(QuotaSnapshot { total, matching, quota: repo_quota }))
    }
}
