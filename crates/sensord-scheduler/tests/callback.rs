// Callback delivery over real HTTP, against a throwaway axum receiver.

use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use sensord_core::CallbackConfig;
use sensord_scheduler::{
    ActionRegistry, CallbackPayload, HttpNotifier, ManualClock, NewScheduleEntry, ResultNotifier,
    Scheduler, SchedulerError, SqliteStore, TaskResult, TaskStatus,
};

type Received = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

async fn capture(
    State(received): State<Received>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received.lock().unwrap().push((auth, body));
    StatusCode::CREATED
}

async fn reject() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Start a receiver on an ephemeral port; returns its base URL.
async fn receiver() -> (String, Received) {
    let received: Received = Arc::default();
    let app = Router::new()
        .route("/hook", post(capture))
        .route("/broken", post(reject))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), received)
}

fn scheduler_with_entry(
    action: &str,
    callback_url: String,
    actions: ActionRegistry,
    callback: &CallbackConfig,
) -> (Scheduler, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(0));
    let entry = NewScheduleEntry {
        start: Some(0),
        callback_url: Some(callback_url),
        ..NewScheduleEntry::new("acq", action)
    }
    .into_entry(clock.as_ref(), &actions)
    .unwrap();
    store.insert_entry(&entry).unwrap();

    let notifier = Arc::new(HttpNotifier::new(callback).unwrap());
    let scheduler =
        Scheduler::new(store.clone(), Arc::new(actions), clock).with_notifier(notifier, callback);
    (scheduler, store)
}

#[tokio::test]
async fn failure_is_posted_with_token() {
    let (base, received) = receiver().await;
    let mut actions = ActionRegistry::new();
    actions.register_blocking("bad_action", |_, _| {
        Err(anyhow::anyhow!("testing expected failure"))
    });
    let callback = CallbackConfig {
        auth_token: Some("s3cret".to_string()),
        result_base_url: "https://sensor.example/api/v1".to_string(),
        ..CallbackConfig::default()
    };
    let (mut scheduler, store) =
        scheduler_with_entry("bad_action", format!("{base}/hook"), actions, &callback);

    scheduler.run_once().await.unwrap();

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let (auth, body) = &received[0];
    assert_eq!(auth.as_deref(), Some("Token s3cret"));
    assert_eq!(body["result"], "failure");
    assert_eq!(body["task_id"], 1);
    assert_eq!(body["url"], "https://sensor.example/api/v1/tasks/completed/acq/1");
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("testing expected failure"));

    let stored = store.get_result("acq", 1).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failure);
}

#[tokio::test]
async fn success_is_posted_without_token() {
    let (base, received) = receiver().await;
    let (mut scheduler, store) = scheduler_with_entry(
        "logger",
        format!("{base}/hook"),
        ActionRegistry::with_builtins(),
        &CallbackConfig::default(),
    );

    scheduler.run_once().await.unwrap();

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, None);
    assert_eq!(received[0].1["result"], "success");
    assert_eq!(
        store.get_result("acq", 1).unwrap().unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn error_status_marks_notification_failed() {
    let (base, _received) = receiver().await;
    let (mut scheduler, store) = scheduler_with_entry(
        "logger",
        format!("{base}/broken"),
        ActionRegistry::with_builtins(),
        &CallbackConfig::default(),
    );

    scheduler.run_once().await.unwrap();

    assert_eq!(
        store.get_result("acq", 1).unwrap().unwrap().status,
        TaskStatus::NotificationFailed
    );
}

#[tokio::test]
async fn notifier_reports_http_errors() {
    let (base, _received) = receiver().await;
    let notifier = HttpNotifier::new(&CallbackConfig::default()).unwrap();
    let mut result = TaskResult::in_progress("acq", 1, chrono::Utc::now());
    result.finish(chrono::Utc::now(), TaskStatus::Success, String::new());
    let payload = CallbackPayload::from_result(&result, "http://localhost/api/v1");

    let err = notifier
        .notify(&format!("{base}/broken"), &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Callback(msg) if msg.contains("500")));

    notifier.notify(&format!("{base}/hook"), &payload).await.unwrap();
}
