//! In-process cluster used by tests and dry runs.
//!
//! Created pods step through a scripted [`Lifecycle`]; watchers receive the
//! same events a real list+watch would produce.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use launchpad_core::PodPhase;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{labels_match, parse_selector, pod_name, ClusterApi, CreateOutcome, DeleteOutcome, PodEvent, PodSummary};

/// What a freshly created pod does on its own.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    /// Phases entered in order, one per `step`.
    pub phases: Vec<PodPhase>,
    pub step: Duration,
    /// Lines served by `log_stream` for every pod.
    pub logs: Vec<String>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phases: vec![PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded],
            step: Duration::from_millis(20),
            logs: vec![
                r#"{"phase":"building","message":"Step 1/3\n"}"#.to_string(),
                r#"{"phase":"building","message":"Step 2/3\n"}"#.to_string(),
            ],
        }
    }
}

impl Lifecycle {
    pub fn failing() -> Self {
        Self {
            phases: vec![PodPhase::Pending, PodPhase::Running, PodPhase::Failed],
            logs: vec![r#"{"phase":"failure","message":"Build failed\n"}"#.to_string()],
            ..Self::default()
        }
    }

    /// Pods stay as created until driven with [`MemoryCluster::set_phase`].
    pub fn manual() -> Self { Self { phases: Vec::new(), ..Self::default() } }
}

#[derive(Default)]
struct State {
    pods: BTreeMap<(String, String), Pod>,
    creates: usize,
    deletes: usize,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<(String, Pod, bool)>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new(Lifecycle::default()) }
}

fn set_status(pod: &mut Pod, phase: PodPhase) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some(phase.as_str().to_string());
}

impl MemoryCluster {
    pub fn new(lifecycle: Lifecycle) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { inner: Arc::new(Inner { state: Mutex::new(State::default()), events, lifecycle: Mutex::new(lifecycle) }) }
    }

    fn state(&self) -> MutexGuard<'_, State> { self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.inner.lifecycle.lock().unwrap_or_else(|p| p.into_inner()) = lifecycle;
    }

    /// Number of pods actually created (conflicts excluded).
    pub fn creates(&self) -> usize { self.state().creates }

    pub fn deletes(&self) -> usize { self.state().deletes }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state().pods.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Seed a pod without going through `create_pod` (no lifecycle, not counted).
    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        let key = (namespace.to_string(), pod_name(&pod).to_string());
        self.state().pods.insert(key, pod.clone());
        let _ = self.inner.events.send((namespace.to_string(), pod, false));
    }

    pub fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        let updated = {
            let mut st = self.state();
            st.pods.get_mut(&(namespace.to_string(), name.to_string())).map(|p| {
                set_status(p, phase);
                p.clone()
            })
        };
        if let Some(p) = updated {
            debug!(pod = %name, phase = %phase.as_str(), "memory cluster phase change");
            let _ = self.inner.events.send((namespace.to_string(), p, false));
        }
    }

    fn snapshot(&self, namespace: &str, selector: &[(String, String)]) -> Vec<Pod> {
        self.state()
            .pods
            .iter()
            .filter(|((ns, _), p)| ns == namespace && labels_match(p, selector))
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ClusterApi for MemoryCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<CreateOutcome> {
        let name = pod_name(pod).to_string();
        let mut created = pod.clone();
        set_status(&mut created, PodPhase::Pending);
        {
            let mut st = self.state();
            let key = (namespace.to_string(), name.clone());
            if st.pods.contains_key(&key) {
                return Ok(CreateOutcome::AlreadyExists);
            }
            st.pods.insert(key, created.clone());
            st.creates += 1;
        }
        let _ = self.inner.events.send((namespace.to_string(), created, false));

        let lifecycle = self.inner.lifecycle.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let this = self.clone();
        let ns = namespace.to_string();
        tokio::spawn(async move {
            for phase in lifecycle.phases {
                tokio::time::sleep(lifecycle.step).await;
                if this.pod(&ns, &name).is_none() {
                    break;
                }
                this.set_phase(&ns, &name, phase);
            }
        });
        Ok(CreateOutcome::Created)
    }

    async fn watch_pods(&self, namespace: &str, label_selector: &str) -> Result<BoxStream<'static, Result<PodEvent>>> {
        let selector = parse_selector(label_selector);
        let rx = self.inner.events.subscribe();
        let initial = PodEvent::Restarted(self.snapshot(namespace, &selector).iter().map(PodSummary::of).collect());
        let ns = namespace.to_string();
        let updates = futures::stream::unfold(rx, move |mut rx| {
            let ns = ns.clone();
            let selector = selector.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((pns, pod, deleted)) if pns == ns && labels_match(&pod, &selector) => {
                            let s = PodSummary::of(&pod);
                            let ev = if deleted { PodEvent::Deleted(s) } else { PodEvent::Applied(s) };
                            return Some((Ok(ev), rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "memory watch lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::once(async move { Ok(initial) }).chain(updates).boxed())
    }

    async fn log_stream(&self, namespace: &str, pod: &str, tail_lines: Option<i64>) -> Result<BoxStream<'static, Result<Bytes>>> {
        if self.pod(namespace, pod).is_none() {
            anyhow::bail!("pod {} not found", pod);
        }
        let logs = self.inner.lifecycle.lock().unwrap_or_else(|p| p.into_inner()).logs.clone();
        let skip = match tail_lines {
            Some(n) if n >= 0 => logs.len().saturating_sub(n as usize),
            _ => 0,
        };
        let chunks: Vec<Result<Bytes>> = logs.into_iter().skip(skip).map(|l| Ok(Bytes::from(format!("{}\n", l)))).collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<DeleteOutcome> {
        let removed = {
            let mut st = self.state();
            let removed = st.pods.remove(&(namespace.to_string(), pod.to_string()));
            if removed.is_some() {
                st.deletes += 1;
            }
            removed
        };
        match removed {
            Some(p) => {
                let _ = self.inner.events.send((namespace.to_string(), p, true));
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self.snapshot(namespace, &parse_selector(label_selector)))
    }
}
