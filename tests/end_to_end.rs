
use async_trait::async_trait;
use autopilot::client::{ControlClient, RetryPolicy, SubmitTask, TaskQuery};
use autopilot::core::agent::{
    Action, AgentRuntime, AgentSpec, Capabilities, CapabilityError, Outcome, SnapshotBackup,
    Validate,
};
use autopilot::core::orchestrator::{Orchestrator, OrchestratorConfig, TaskExecutor};
use autopilot::core::store::Stores;
use autopilot::core::tasks::{Parameters, TaskStatus};
use autopilot::core::webhook::{
    DeliveryConfig, SIGNATURE_HEADER, WebhookDispatcher, verify_signature,
};
use autopilot::interfaces::web::{AppState, serve};
use axum::{Router, body::Bytes, extract::State, http::HeaderMap, routing::post};
use harness::{TestResult, eventually, spawn_router};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const VERSION_FILE: &str = "version.txt";

/// Writes the `version` parameter into the subject directory.
struct WriteVersion;

#[async_trait]
impl Action for WriteVersion {
    async fn run(&self, subject: &str, params: &Parameters) -> Result<Outcome, CapabilityError> {
        let version = params
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tokio::fs::write(Path::new(subject).join(VERSION_FILE), version).await?;
        Ok(Outcome::success(format!("wrote {}", version)))
    }
}

/// Rejects a workspace whose version is `bad`.
struct RejectBad;

#[async_trait]
impl Validate for RejectBad {
    async fn run(&self, subject: &str) -> Result<Outcome, CapabilityError> {
        let version = tokio::fs::read_to_string(Path::new(subject).join(VERSION_FILE)).await?;
        if version == "bad" {
            Ok(Outcome::failure("version rejected"))
        } else {
            Ok(Outcome::success("version accepted"))
        }
    }
}

type Deliveries = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

async fn record(State(deliveries): State<Deliveries>, headers: HeaderMap, body: Bytes) {
    deliveries.lock().await.push((headers, body));
}

struct Rig {
    client: ControlClient,
    workspace: tempfile::TempDir,
    deliveries: Deliveries,
    cancel: CancellationToken,
    _data: tempfile::TempDir,
}

async fn start_rig() -> TestResult<Rig> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    std::fs::write(workspace.path().join(VERSION_FILE), "1")?;

    let stores = Stores::memory();
    let cancel = CancellationToken::new();

    let (dispatcher, sender) = WebhookDispatcher::new(
        stores.webhooks.clone(),
        DeliveryConfig {
            max_attempts: 1,
            request_timeout: Duration::from_secs(2),
            base_backoff: Duration::from_millis(10),
        },
    )?;
    tokio::spawn(dispatcher.run(cancel.child_token()));

    let subject = workspace.path().to_string_lossy().to_string();
    let runtime = AgentRuntime::start(
        AgentSpec::new("builder", subject).with_task_types(&["build"]),
        Capabilities {
            backup: Some(Arc::new(SnapshotBackup::new(data.path().join("backups")))),
            action: Arc::new(WriteVersion),
            validate: Some(Arc::new(RejectBad)),
            test: None,
        },
        stores.status.clone(),
    )
    .await?;

    let orchestrator = Orchestrator::new(
        stores.tasks.clone(),
        stores.status.clone(),
        vec![runtime as Arc<dyn TaskExecutor>],
        sender,
        OrchestratorConfig {
            tick: Duration::from_millis(20),
            default_timeout: Duration::from_secs(30),
        },
    );
    tokio::spawn(orchestrator.clone().run(cancel.child_token()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(stores, orchestrator, Some("s3cret".into()), addr.port());
    tokio::spawn(serve(listener, state, cancel.child_token()));

    let deliveries: Deliveries = Arc::default();
    let receiver = Router::new()
        .route("/hook", post(record))
        .with_state(deliveries.clone());
    let (hook_addr, _) = spawn_router(receiver).await?;

    let client = ControlClient::new(&format!("http://{}", addr))?
        .with_token(Some("s3cret".into()))
        .with_policy(RetryPolicy {
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        });
    client
        .create_webhook(
            &format!("http://{}/hook", hook_addr),
            &["task.completed".to_string(), "task.failed".to_string()],
            Some("hook-secret"),
            None,
        )
        .await?;

    Ok(Rig {
        client,
        workspace,
        deliveries,
        cancel,
        _data: data,
    })
}

async fn submit_version(client: &ControlClient, version: &str) -> TestResult<String> {
    let mut params = Parameters::new();
    params.insert("version", serde_json::json!(version))?;
    let mut task = SubmitTask::new("build");
    task.parameters = Some(params);
    let reply = client.submit_task(&task).await?;
    assert_eq!(reply.status_code, 201);
    assert_eq!(reply.data.status, TaskStatus::Queued);
    Ok(reply.data.id)
}

async fn wait_terminal(client: &ControlClient, id: &str) -> Option<autopilot::core::tasks::Task> {
    eventually(Duration::from_secs(10), move || async move {
        let task = client.get_task(id).await.ok()?.data;
        task.status.is_terminal().then_some(task)
    })
    .await
}

#[tokio::test]
async fn successful_build_is_kept_and_announced() -> TestResult<()> {
    let rig = start_rig().await?;

    let id = submit_version(&rig.client, "2").await?;
    let task = wait_terminal(&rig.client, &id)
        .await
        .ok_or("task never finished")?;
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.assigned_agent.as_deref(), Some("builder"));
    assert_eq!(
        std::fs::read_to_string(rig.workspace.path().join(VERSION_FILE))?,
        "2"
    );

    let agent = rig.client.controller("builder").await?.data;
    assert_eq!(agent.tasks_completed, 1);
    assert_eq!(agent.consecutive_failures, 0);

    let status = rig.client.status().await?.data;
    assert_eq!(status.tasks.get("succeeded"), Some(&1));
    assert_eq!(status.executors, vec!["builder".to_string()]);

    let deliveries = &rig.deliveries;
    let delivered = eventually(Duration::from_secs(5), move || async move {
        let deliveries = deliveries.lock().await;
        (!deliveries.is_empty()).then(|| deliveries[0].clone())
    })
    .await
    .ok_or("no webhook delivery")?;
    let (headers, body) = delivered;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or("missing signature")?;
    assert!(verify_signature("hook-secret", &body, signature));
    let payload: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(payload["event_type"], "task.completed");

    let client = &rig.client;
    let stats = eventually(Duration::from_secs(5), move || async move {
        let stats = client.webhook_stats().await.ok()?.data;
        (stats.deliveries.success >= 1).then_some(stats)
    })
    .await
    .ok_or("delivery never recorded")?;
    assert_eq!(stats.total_webhooks, 1);
    assert_eq!(stats.deliveries.failed, 0);

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn rejected_build_is_rolled_back() -> TestResult<()> {
    let rig = start_rig().await?;

    let good = submit_version(&rig.client, "2").await?;
    wait_terminal(&rig.client, &good)
        .await
        .ok_or("first task never finished")?;

    let bad = submit_version(&rig.client, "bad").await?;
    let task = wait_terminal(&rig.client, &bad)
        .await
        .ok_or("second task never finished")?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());
    assert_eq!(
        std::fs::read_to_string(rig.workspace.path().join(VERSION_FILE))?,
        "2"
    );

    let agent = rig.client.controller("builder").await?.data;
    assert_eq!(agent.tasks_completed, 1);
    assert_eq!(agent.consecutive_failures, 1);

    let failed = rig
        .client
        .list_tasks(&TaskQuery {
            status: Some(TaskStatus::Failed),
            ..TaskQuery::default()
        })
        .await?
        .data;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, bad);

    let deliveries = &rig.deliveries;
    let events = eventually(Duration::from_secs(5), move || async move {
        let deliveries = deliveries.lock().await;
        (deliveries.len() >= 2).then(|| {
            deliveries
                .iter()
                .filter_map(|(_, body)| serde_json::from_slice::<serde_json::Value>(body).ok())
                .map(|p| p["event_type"].as_str().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
        })
    })
    .await
    .ok_or("missing webhook deliveries")?;
    assert!(events.contains(&"task.failed".to_string()));

    rig.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn requests_without_the_token_are_rejected() -> TestResult<()> {
    let rig = start_rig().await?;
    let anonymous = ControlClient::new(rig.client.base_url())?;

    let err = anonymous.status().await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert!(anonymous.health().await.is_ok());

    rig.cancel.cancel();
    Ok(())
}
