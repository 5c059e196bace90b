use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use launchpad_build::{cleanup_builds, BuildExecutor, BuildJob, BuildOptions, KubeBuild, LocalBuild};
use launchpad_core::{BuildStatus, PodPhase, ProgressEvent};
use launchpad_kubehub::{CancelHandle, Lifecycle, MemoryCluster, StreamHandle};
use serde_json::json;

fn job(name: &str) -> BuildJob {
    let opts = BuildOptions { namespace: "builds".into(), log_tail_lines: 1, ..BuildOptions::default() };
    BuildJob::new(name, "https://github.com/org/repo", "abcdef0", "reg/org-repo:abcdef0", opts)
}

/// Drain a handle until a terminal status, or until the queue closes.
async fn collect(handle: &mut StreamHandle<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), handle.rx.recv()).await {
            Ok(Some(ev)) => {
                let done = matches!(&ev, ProgressEvent::BuildStatusChange(s) if s.is_terminal());
                events.push(ev);
                if done {
                    return events;
                }
            }
            Ok(None) => return events,
            Err(_) => panic!("timed out; got {events:?}"),
        }
    }
}

fn messages(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::LogMessage(l) => l.message().map(str::to_string),
            _ => None,
        })
        .collect()
}

fn last_status(events: &[ProgressEvent]) -> Option<BuildStatus> {
    events.iter().rev().find_map(|e| match e {
        ProgressEvent::BuildStatusChange(s) => Some(*s),
        _ => None,
    })
}

#[tokio::test]
async fn successful_build_reports_phases_logs_and_cleans_up() {
    let cluster = MemoryCluster::default();
    let exec = KubeBuild::new(Arc::new(cluster.clone()));
    let mut handle = exec.submit(job("build-a"), CancelHandle::new()).await.unwrap();
    let events = collect(&mut handle).await;
    assert_eq!(last_status(&events), Some(BuildStatus::Completed));
    assert!(events.contains(&ProgressEvent::PodPhaseChange(PodPhase::Running)) || events.contains(&ProgressEvent::PodPhaseChange(PodPhase::Succeeded)));
    assert_eq!(messages(&events), vec!["Step 1/3\n", "Step 2/3\n"]);
    assert_eq!(cluster.creates(), 1);
    assert_eq!(cluster.deletes(), 1);
    assert!(cluster.pod("builds", "build-a").is_none());
}

#[tokio::test]
async fn failed_build_reports_failure_and_cleans_up() {
    let cluster = MemoryCluster::new(Lifecycle::failing());
    let exec = KubeBuild::new(Arc::new(cluster.clone()));
    let mut handle = exec.submit(job("build-f"), CancelHandle::new()).await.unwrap();
    let events = collect(&mut handle).await;
    assert_eq!(last_status(&events), Some(BuildStatus::Failed));
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::LogMessage(l) if l.is_failure())));
    assert_eq!(cluster.deletes(), 1);
}

#[tokio::test]
async fn concurrent_submits_share_one_pod() {
    let cluster = MemoryCluster::new(Lifecycle { step: Duration::from_millis(50), ..Lifecycle::default() });
    let exec = Arc::new(KubeBuild::new(Arc::new(cluster.clone())));
    let (a, b) = tokio::join!(exec.submit(job("build-same"), CancelHandle::new()), exec.submit(job("build-same"), CancelHandle::new()));
    let (mut a, mut b) = (a.unwrap(), b.unwrap());
    let (ea, eb) = tokio::join!(collect(&mut a), collect(&mut b));
    assert_eq!(cluster.creates(), 1);
    assert_eq!(last_status(&ea), Some(BuildStatus::Completed));
    assert_eq!(last_status(&eb), Some(BuildStatus::Completed));
}

#[tokio::test]
async fn joining_a_running_build_tails_its_logs() {
    let cluster = MemoryCluster::new(Lifecycle::manual());
    let j = job("build-joined");
    cluster.insert_pod("builds", j.pod_manifest(&[]).unwrap());
    cluster.set_phase("builds", "build-joined", PodPhase::Running);
    let exec = KubeBuild::new(Arc::new(cluster.clone()));
    let mut handle = exec.submit(j, CancelHandle::new()).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), handle.rx.recv()).await.unwrap();
    assert_eq!(first, Some(ProgressEvent::PodPhaseChange(PodPhase::Running)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.set_phase("builds", "build-joined", PodPhase::Succeeded);
    let events = collect(&mut handle).await;
    assert_eq!(messages(&events), vec!["Step 2/3\n"]);
    assert_eq!(last_status(&events), Some(BuildStatus::Completed));
    assert_eq!(cluster.creates(), 0);
}

#[tokio::test]
async fn cancel_stops_watching_but_leaves_the_pod() {
    let cluster = MemoryCluster::new(Lifecycle::manual());
    let exec = KubeBuild::new(Arc::new(cluster.clone()));
    let cancel = CancelHandle::new();
    let mut handle = exec.submit(job("build-c"), cancel.clone()).await.unwrap();
    cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "queue should close after cancel");
    assert!(cluster.pod("builds", "build-c").is_some());
}

fn build_pod(name: &str, phase: &str, reason: Option<&str>, started: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": {"name": name, "labels": {"component": "binderhub-build"}, "annotations": {"binder-repo": "r"}},
        "status": {"phase": phase, "reason": reason, "startTime": started}
    }))
    .unwrap()
}

#[tokio::test]
async fn cleanup_removes_finished_and_stale_builds() {
    let cluster = MemoryCluster::new(Lifecycle::manual());
    let now = chrono::Utc::now();
    let stamp = |t: chrono::DateTime<chrono::Utc>| t.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let (old, fresh) = (stamp(now - chrono::Duration::hours(5)), stamp(now));
    cluster.insert_pod("builds", build_pod("done", "Succeeded", None, &fresh));
    cluster.insert_pod("builds", build_pod("evicted", "Failed", Some("Evicted"), &fresh));
    cluster.insert_pod("builds", build_pod("stuck", "Running", None, &old));
    cluster.insert_pod("builds", build_pod("busy", "Running", None, &fresh));
    let deleted = cleanup_builds(&cluster, "builds", Duration::from_secs(3600)).await.unwrap();
    assert_eq!(deleted, 3);
    assert!(cluster.pod("builds", "busy").is_some());
}

fn local(script: &str) -> LocalBuild { LocalBuild::new().with_command("sh", &["-c", script, "sh"]) }

#[tokio::test]
async fn local_build_relays_lines_and_wraps_plain_text() {
    let exec = local(r#"printf '%s\n' '{"phase":"building","message":"hi\n"}'; echo plain text; exit 0"#);
    let mut handle = exec.submit(job("local-ok"), CancelHandle::new()).await.unwrap();
    let events = collect(&mut handle).await;
    assert_eq!(events.first(), Some(&ProgressEvent::BuildStatusChange(BuildStatus::Running)));
    assert_eq!(last_status(&events), Some(BuildStatus::Completed));
    assert_eq!(messages(&events), vec!["hi\n", "plain text\n"]);
    let phases: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::LogMessage(l) => l.phase().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec!["building", "unknown"]);
}

#[tokio::test]
async fn local_build_nonzero_exit_is_failure() {
    let mut handle = local("echo oops >&2; exit 3").submit(job("local-fail"), CancelHandle::new()).await.unwrap();
    let events = collect(&mut handle).await;
    assert_eq!(last_status(&events), Some(BuildStatus::Failed));
    assert_eq!(messages(&events), vec!["oops\n"]);
}

#[tokio::test]
async fn local_build_stop_is_terminated_not_failed() {
    let exec = local("sleep 30");
    let cancel = CancelHandle::new();
    let mut handle = exec.submit(job("local-stop"), cancel.clone()).await.unwrap();
    assert_eq!(handle.rx.recv().await, Some(ProgressEvent::BuildStatusChange(BuildStatus::Running)));
    let started = std::time::Instant::now();
    cancel.cancel();
    let events = collect(&mut handle).await;
    assert_eq!(last_status(&events), Some(BuildStatus::Terminated));
    assert!(started.elapsed() < Duration::from_secs(5));
}
