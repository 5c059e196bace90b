//! Launchpad kubehub: the cluster seam used by builds and quota checks.
//!
//! Only five pod operations are needed: create (a name conflict is reported,
//! not raised), watch by label, follow logs, delete (not-found is reported,
//! not raised) and list by label. `KubeCluster` talks to a real API server;
//! `MemoryCluster` is an in-process stand-in used by tests.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, PostParams},
    runtime::watcher::{self, Event},
    Client,
};
use launchpad_core::PodPhase;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod memory;

pub use memory::{Lifecycle, MemoryCluster};

/// Name and phase of one pod as seen by a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub phase: PodPhase,
}

impl PodSummary {
    pub fn of(pod: &Pod) -> Self { Self { name: pod_name(pod).to_string(), phase: pod_phase(pod) } }
}

/// Watch events, mirroring the list+watch protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Applied(PodSummary),
    Deleted(PodSummary),
    /// Full relist: every pod currently matching the selector.
    Restarted(Vec<PodSummary>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another caller created a pod with this name first.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

pub fn pod_name(pod: &Pod) -> &str { pod.metadata.name.as_deref().unwrap_or_default() }

pub fn pod_phase(pod: &Pod) -> PodPhase {
    PodPhase::from_k8s(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Cluster operations the engine depends on.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<CreateOutcome>;

    /// List+watch pods matching `label_selector`. The first item is a `Restarted` snapshot.
    async fn watch_pods(&self, namespace: &str, label_selector: &str) -> Result<BoxStream<'static, Result<PodEvent>>>;

    /// Follow a pod's output; with `tail_lines` only the last n lines already written are replayed.
    async fn log_stream(&self, namespace: &str, pod: &str, tail_lines: Option<i64>) -> Result<BoxStream<'static, Result<Bytes>>>;

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<DeleteOutcome>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
}

/// Cancellation shared by every background activity of one run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.token.cancel(); }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Child handle: cancelled with its parent, but cancelling it leaves the parent alone.
    pub fn child(&self) -> Self { Self { token: self.token.child_token() } }

    pub async fn cancelled(&self) { self.token.cancelled().await }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// kube-rs backed implementation.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), namespace) }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<CreateOutcome> {
        match self.pods(namespace).create(&PostParams::default(), pod).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(pod = %pod_name(pod), ns = %namespace, "pod already exists");
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e).with_context(|| format!("creating pod {}", pod_name(pod))),
        }
    }

    async fn watch_pods(&self, namespace: &str, label_selector: &str) -> Result<BoxStream<'static, Result<PodEvent>>> {
        let cfg = watcher::Config::default().labels(label_selector);
        info!(ns = %namespace, selector = %label_selector, "pod watch started");
        let stream = watcher::watcher(self.pods(namespace), cfg)
            .map_err(anyhow::Error::from)
            .map_ok(|ev| match ev {
                Event::Applied(p) => PodEvent::Applied(PodSummary::of(&p)),
                Event::Deleted(p) => PodEvent::Deleted(PodSummary::of(&p)),
                Event::Restarted(list) => {
                    debug!(count = list.len(), "watch restart");
                    PodEvent::Restarted(list.iter().map(PodSummary::of).collect())
                }
            });
        Ok(stream.boxed())
    }

    async fn log_stream(&self, namespace: &str, pod: &str, tail_lines: Option<i64>) -> Result<BoxStream<'static, Result<Bytes>>> {
        let api = self.pods(namespace);
        let lp = LogParams { follow: true, tail_lines, ..LogParams::default() };
        let cap = std::env::var("LAUNCHPAD_LOG_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(256);
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(cap);
        let pod_name = pod.to_string();
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            info!(pod = %pod_name, tail = ?lp.tail_lines, "log stream starting");
            let reader = match api.log_stream(&pod_name, &lp).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "log_stream failed to open");
                    let _ = tx.send(Err(anyhow::Error::from(e).context("opening log stream"))).await;
                    return;
                }
            };
            let stream = ReaderStream::new(reader.compat());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.next() => match next {
                        Some(item) => {
                            if tx.send(item.map_err(anyhow::Error::from)).await.is_err() { break; }
                        }
                        None => break,
                    }
                }
            }
            debug!(pod = %pod_name, "log stream forwarder ended");
        });
        Ok(receiver_stream(rx))
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<DeleteOutcome> {
        match self.pods(namespace).delete(pod, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e).with_context(|| format!("deleting pod {}", pod)),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(label_selector);
        let list = self.pods(namespace).list(&lp).await.with_context(|| format!("listing pods {}", label_selector))?;
        Ok(list.items)
    }
}

/// Adapt a bounded receiver into a boxed stream.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Split a byte stream into lines and forward each through `map` into `tx`.
/// A trailing partial line is flushed at end of stream. Stops on cancel, on a
/// stream error, or when the receiver is gone.
pub async fn pump_bytes_to_lines<S, E, T, F>(stream: S, tx: mpsc::Sender<T>, cancel: CancelHandle, ctx: &str, mut map: F)
where
    S: futures::Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(String) -> T,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let mut closed = false;
    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => { info!(ctx = %ctx, "log pump cancelled"); closed = true; break; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1);
                            let s = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
                            if !send_or_cancel(&tx, &cancel, map(s)).await { closed = true; break 'outer; }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "log stream error"); break; }
                    None => break,
                }
            }
        }
    }
    if !closed && !buf.is_empty() {
        let s = String::from_utf8_lossy(&buf).to_string();
        let _ = send_or_cancel(&tx, &cancel, map(s)).await;
    }
    info!(ctx = %ctx, "log pump ended");
}

async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, cancel: &CancelHandle, item: T) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        r = tx.send(item) => r.is_ok(),
    }
}

/// Parse an equality-only label selector (`k=v,k2=v2`).
pub fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub fn labels_match(pod: &Pod, selector: &[(String, String)]) -> bool {
    let labels = pod.metadata.labels.as_ref();
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunk(b: &'static [u8]) -> std::result::Result<Bytes, std::io::Error> { Ok(Bytes::from_static(b)) }

    #[tokio::test]
    async fn splits_lines_across_chunks_and_flushes_tail() {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        let s = stream::iter(vec![chunk(b"hello\nwor"), chunk(b"ld\r\n"), chunk(b"tail")]);
        pump_bytes_to_lines(s, tx, CancelHandle::new(), "test", |l| l).await;
        let mut out = Vec::new();
        while let Some(l) = rx.recv().await { out.push(l); }
        assert_eq!(out, vec!["hello", "world", "tail"]);
    }

    #[tokio::test]
    async fn bounded_channel_applies_backpressure_without_dropping() {
        let (tx, mut rx) = mpsc::channel::<String>(1);
        let s = stream::iter(vec![chunk(b"a\n"), chunk(b"b\n"), chunk(b"c\n")]);
        let pump = tokio::spawn(pump_bytes_to_lines(s, tx, CancelHandle::new(), "bp-test", |l| l));
        let mut recv = Vec::new();
        while let Some(l) = rx.recv().await { recv.push(l); }
        pump.await.unwrap();
        assert_eq!(recv, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancel_stops_pump_quickly() {
        let (tx, _rx) = mpsc::channel::<String>(16);
        let cancel = CancelHandle::new();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                yield chunk(b"line\n");
            }
        };
        let handle = tokio::spawn(pump_bytes_to_lines(s, tx, cancel.clone(), "cancel-test", |l| l));
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.expect("pump did not stop").unwrap();
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancelHandle::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        let child2 = parent.child();
        parent.cancel();
        assert!(child2.is_cancelled());
    }

    #[test]
    fn selector_parses_pairs() {
        assert_eq!(
            parse_selector("app=jupyterhub,component=singleuser-server"),
            vec![("app".to_string(), "jupyterhub".to_string()), ("component".to_string(), "singleuser-server".to_string())]
        );
    }
}
