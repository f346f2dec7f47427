use std::sync::Arc;
use std::time::Duration;

use super::Harness;
use crate::core::status::{AgentState, StatusStore};
use crate::core::tasks::{Priority, QueueSettings, Task, TaskQueue, TaskStatus};

fn settings(parallel_mode: bool, max_concurrent: usize) -> QueueSettings {
    QueueSettings {
        parallel_mode,
        max_concurrent,
    }
}

#[tokio::test]
async fn running_count_never_exceeds_max_concurrent() {
    let h = Harness::new(
        settings(true, 2),
        &[
            ("b1", &["build"]),
            ("b2", &["build"]),
            ("b3", &["build"]),
        ],
    );
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.submit(Task::new("build")).await.id);
    }

    let report = h.orchestrator.dispatch_tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    // Idempotent while nothing finished.
    let again = h.orchestrator.dispatch_tick().await.unwrap();
    assert!(again.dispatched.is_empty());

    for _ in 0..3 {
        h.gate.add_permits(2);
        h.wait_idle().await;
        h.orchestrator.dispatch_tick().await.unwrap();
    }

    for id in &ids {
        assert_eq!(h.status_of(id).await, TaskStatus::Succeeded);
    }
    assert!(h.observed.max_active() <= 2);
}

#[tokio::test]
async fn serial_mode_runs_one_task_at_a_time() {
    let h = Harness::new(
        settings(false, 4),
        &[("scan-a", &["scan"]), ("scan-b", &["scan"])],
    );
    h.submit(Task::new("scan")).await;
    h.submit(Task::new("scan")).await;

    let report = h.orchestrator.dispatch_tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let queued = TaskQueue::list(
        h.store.as_ref(),
        &crate::core::tasks::TaskFilter::status(TaskStatus::Queued),
    )
    .await
    .unwrap();
    assert_eq!(queued.len(), 1);
}

#[tokio::test]
async fn non_parallel_tasks_of_one_type_are_serialised() {
    let h = Harness::new(
        settings(true, 3),
        &[
            ("deploy-a", &["deploy", "scan"]),
            ("deploy-b", &["deploy", "scan"]),
            ("deploy-c", &["deploy", "scan"]),
        ],
    );
    let first = h.submit(Task::new("deploy").with_parallel(false)).await;
    let second = h.submit(Task::new("deploy").with_parallel(false)).await;
    let parallel_same_type = h.submit(Task::new("deploy")).await;
    let other_type = h.submit(Task::new("scan")).await;

    let report = h.orchestrator.dispatch_tick().await.unwrap();
    let dispatched: Vec<_> = report.dispatched.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(dispatched, vec![first.id.clone(), other_type.id.clone()]);
    assert_eq!(h.status_of(&second.id).await, TaskStatus::Queued);
    assert_eq!(h.status_of(&parallel_same_type.id).await, TaskStatus::Queued);
}

#[tokio::test]
async fn higher_priority_is_dispatched_first_then_fifo() {
    let h = Harness::new(settings(true, 1), &[("worker", &["scan"])]);
    let low = h.submit(Task::new("scan").with_priority(Priority::Low)).await;
    let normal_a = h.submit(Task::new("scan")).await;
    let normal_b = h.submit(Task::new("scan")).await;
    let critical = h
        .submit(Task::new("scan").with_priority(Priority::Critical))
        .await;

    for _ in 0..4 {
        h.orchestrator.dispatch_tick().await.unwrap();
        h.release_one();
        h.wait_idle().await;
    }
    assert_eq!(
        h.observed.started(),
        vec![critical.id, normal_a.id, normal_b.id, low.id]
    );
}

#[tokio::test]
async fn tasks_without_a_capable_executor_stay_queued() {
    let h = Harness::new(settings(true, 2), &[("builder", &["build"])]);
    let update = h.submit(Task::new("update")).await;
    let build = h.submit(Task::new("build")).await;

    let report = h.orchestrator.dispatch_tick().await.unwrap();
    assert_eq!(report.dispatched, vec![(build.id, "builder".to_string())]);
    assert_eq!(h.status_of(&update.id).await, TaskStatus::Queued);
}

#[tokio::test]
async fn degraded_and_stale_agents_receive_no_work() {
    let h = Harness::new(
        settings(true, 2),
        &[("degraded", &["scan"]), ("stale", &["scan"])],
    );
    let (lease, mut status) = h
        .store
        .claim("degraded", &["scan".into()], Duration::from_secs(60))
        .await
        .unwrap();
    status.state = AgentState::Degraded;
    h.store.upsert(&lease, &status).await.unwrap();

    // A zero interval makes any silence longer than 3 * 0s stale.
    let (lease, mut status) = h
        .store
        .claim("stale", &["scan".into()], Duration::ZERO)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let task = h.submit(Task::new("scan")).await;
    let report = h.orchestrator.dispatch_tick().await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(h.status_of(&task.id).await, TaskStatus::Queued);

    // A fresh write with a real interval brings the stale agent back.
    status.current_interval = 60;
    status.state = AgentState::Active;
    status.last_heartbeat = chrono::Utc::now();
    h.store.upsert(&lease, &status).await.unwrap();
    let report = h.orchestrator.dispatch_tick().await.unwrap();
    assert_eq!(report.dispatched, vec![(task.id, "stale".to_string())]);
}

#[tokio::test]
async fn failed_executions_are_recorded_with_error() {
    use super::{GatedExecutor, Observed};
    use crate::core::orchestrator::{Orchestrator, OrchestratorConfig, TaskExecutor};
    use crate::core::store::MemoryStore;
    use crate::core::webhook::WebhookSender;
    use tokio::sync::Semaphore;

    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let observed = Observed::default();
    let executor: Arc<dyn TaskExecutor> =
        Arc::new(GatedExecutor::new("builder", &["build"], gate, &observed).failing());
    let orchestrator = Orchestrator::new(
        store.clone(),
        store.clone(),
        vec![executor],
        WebhookSender::disabled(),
        OrchestratorConfig::default(),
    );
    let task = orchestrator.submit(Task::new("build")).await.unwrap();
    orchestrator.dispatch_tick().await.unwrap();

    for _ in 0..200 {
        if orchestrator.in_flight().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stored = TaskQueue::get(store.as_ref(), &task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("action failed; rolled back"));
    assert!(stored.completed_at.is_some());
}
