//! Launchpad builds.
//!
//! A [`BuildJob`] describes one image build of one repository at one ref. Its
//! name is a pure function of (build slug, ref), so concurrent requests for
//! the same build meet at the same cluster object: the first create wins and
//! every other caller just observes. Executors report on a bounded queue of
//! [`ProgressEvent`]s until the build reaches a terminal status.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use launchpad_core::ProgressEvent;
use launchpad_kubehub::{CancelHandle, StreamHandle};
use serde_json::json;

mod cluster;
mod local;

pub use cluster::{cleanup_builds, KubeBuild, DIND_POD_SELECTOR};
pub use local::LocalBuild;

pub const BUILD_COMPONENT_LABEL: &str = "binderhub-build";
pub const BUILDER_COMMAND: &str = "jupyter-repo2docker";

/// Settings shared by every build of one deployment.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub namespace: String,
    pub builder_image: String,
    /// Docker daemon socket on the node, as `unix:///path`.
    pub docker_host: String,
    pub push_secret: Option<String>,
    pub memory_limit: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub appendix: Option<String>,
    pub proxy: Option<String>,
    pub no_proxy: Option<String>,
    /// Lines of history requested when joining a build someone else started.
    pub log_tail_lines: i64,
    /// Prefer the node that built this repository before.
    pub sticky_builds: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            builder_image: "quay.io/jupyterhub/repo2docker:2023.06.0".into(),
            docker_host: "unix:///var/run/docker.sock".into(),
            push_secret: None,
            memory_limit: None,
            memory_request: None,
            cpu_limit: None,
            cpu_request: None,
            node_selector: BTreeMap::new(),
            appendix: None,
            proxy: None,
            no_proxy: None,
            log_tail_lines: 100,
            sticky_builds: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildJob {
    pub name: String,
    pub repo_url: String,
    pub git_ref: String,
    pub image_name: String,
    pub git_credentials: Option<String>,
    pub opts: BuildOptions,
}

impl BuildJob {
    pub fn new(name: &str, repo_url: &str, git_ref: &str, image_name: &str, opts: BuildOptions) -> Self {
        Self {
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            git_ref: git_ref.to_string(),
            image_name: image_name.to_string(),
            git_credentials: None,
            opts,
        }
    }

    pub fn with_git_credentials(mut self, credentials: Option<String>) -> Self {
        self.git_credentials = credentials;
        self
    }

    pub fn namespace(&self) -> &str { &self.opts.namespace }

    /// Selector matching exactly this build's pod.
    pub fn selector(&self) -> String { format!("name={}", self.name) }

    /// Builder flags; the repository URL is appended separately, last.
    pub fn builder_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--ref={}", self.git_ref),
            format!("--image={}", self.image_name),
            "--no-clean".to_string(),
            "--no-run".to_string(),
            "--json-logs".to_string(),
            "--user-name=jovyan".to_string(),
            "--user-id=1000".to_string(),
        ];
        if let Some(appendix) = self.opts.appendix.as_deref().filter(|a| !a.is_empty()) {
            args.extend(["--appendix".to_string(), appendix.to_string()]);
        }
        if self.opts.push_secret.is_some() {
            args.push("--push".to_string());
        }
        if let Some(mem) = self.opts.memory_limit.as_deref().filter(|m| !m.is_empty() && *m != "0") {
            args.extend(["--build-memory-limit".to_string(), mem.to_string()]);
        }
        args
    }

    /// Full builder command line. The URL goes last so it is never read as a flag value.
    pub fn command(&self) -> Vec<String> {
        let mut cmd = vec![BUILDER_COMMAND.to_string()];
        cmd.extend(self.builder_args());
        cmd.push(self.repo_url.clone());
        cmd
    }

    fn env(&self) -> Vec<serde_json::Value> {
        let mut env = Vec::new();
        if let Some(c) = &self.git_credentials {
            env.push(json!({"name": "GIT_CREDENTIAL_ENV", "value": c}));
        }
        if let Some(p) = &self.opts.proxy {
            for name in ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"] {
                env.push(json!({"name": name, "value": p}));
            }
        }
        if let Some(p) = &self.opts.no_proxy {
            for name in ["NO_PROXY", "no_proxy"] {
                env.push(json!({"name": name, "value": p}));
            }
        }
        env
    }

    /// Anti-affinity between builds, or with sticky builds a preference for
    /// the docker-in-docker node ranked first for this repository.
    pub fn affinity(&self, dind_nodes: &[String]) -> serde_json::Value {
        match launchpad_core::rendezvous_rank(dind_nodes, &self.repo_url).first() {
            Some(best) if self.opts.sticky_builds => json!({
                "nodeAffinity": {
                    "preferredDuringSchedulingIgnoredDuringExecution": [{
                        "weight": 100,
                        "preference": {"matchExpressions": [{
                            "key": "kubernetes.io/hostname",
                            "operator": "In",
                            "values": [best],
                        }]},
                    }],
                },
            }),
            _ => json!({
                "podAntiAffinity": {
                    "preferredDuringSchedulingIgnoredDuringExecution": [{
                        "weight": 100,
                        "podAffinityTerm": {
                            "topologyKey": "kubernetes.io/hostname",
                            "labelSelector": {"matchLabels": {"component": BUILD_COMPONENT_LABEL}},
                        },
                    }],
                },
            }),
        }
    }

    pub fn pod_manifest(&self, dind_nodes: &[String]) -> anyhow::Result<Pod> {
        let socket_path = self.opts.docker_host.strip_prefix("unix://").unwrap_or(&self.opts.docker_host);
        let mut mounts = vec![json!({"mountPath": "/var/run/docker.sock", "name": "docker-socket"})];
        let mut volumes = vec![json!({"name": "docker-socket", "hostPath": {"path": socket_path, "type": "Socket"}})];
        if let Some(secret) = &self.opts.push_secret {
            mounts.push(json!({"mountPath": "/root/.docker", "name": "docker-config"}));
            volumes.push(json!({"name": "docker-config", "secret": {"secretName": secret}}));
        }
        let quantities = |mem: &Option<String>, cpu: &Option<String>| {
            let mut m = serde_json::Map::new();
            if let Some(v) = mem.as_deref().filter(|v| !v.is_empty() && *v != "0") {
                m.insert("memory".into(), json!(v));
            }
            if let Some(v) = cpu.as_deref().filter(|v| !v.is_empty() && *v != "0") {
                m.insert("cpu".into(), json!(v));
            }
            serde_json::Value::Object(m)
        };
        let toleration = |key: &str| json!({"key": key, "operator": "Equal", "value": "user", "effect": "NoSchedule"});
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "labels": {"name": self.name, "component": BUILD_COMPONENT_LABEL},
                "annotations": {"binder-repo": self.repo_url},
            },
            "spec": {
                "containers": [{
                    "name": "builder",
                    "image": self.opts.builder_image,
                    "args": self.command(),
                    "volumeMounts": mounts,
                    "env": self.env(),
                    "resources": {
                        "limits": quantities(&self.opts.memory_limit, &self.opts.cpu_limit),
                        "requests": quantities(&self.opts.memory_request, &self.opts.cpu_request),
                    },
                }],
                "tolerations": [toleration("hub.jupyter.org/dedicated"), toleration("hub.jupyter.org_dedicated")],
                "nodeSelector": self.opts.node_selector,
                "volumes": volumes,
                "restartPolicy": "Never",
                "affinity": self.affinity(dind_nodes),
            },
        });
        serde_json::from_value(manifest).with_context(|| format!("building pod manifest for {}", self.name))
    }
}

/// Runs a [`BuildJob`] to completion, relaying progress.
///
/// The returned handle's queue ends after a terminal
/// [`launchpad_core::BuildStatus`]. Cancelling the handle stops all
/// background activity of this executor for the job; whether the build
/// itself keeps going depends on the executor.
#[async_trait::async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn submit(&self, job: BuildJob, cancel: CancelHandle) -> anyhow::Result<StreamHandle<ProgressEvent>>;

    /// Delete finished or stale builds. Returns how many were removed.
    async fn cleanup_builds(&self, _namespace: &str, _max_age: Duration) -> anyhow::Result<usize> { Ok(0) }
}
