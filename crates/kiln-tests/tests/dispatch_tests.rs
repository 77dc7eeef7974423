//! End-to-end dispatch tests over the worker wire protocol.
//!
//! Run with: `cargo test -p kiln-tests --test dispatch_tests`

use futures::StreamExt;
use kiln_core::capability::CapabilityRequirement;
use kiln_core::events::Event;
use kiln_core::protocol::{MasterFrame, WorkerFrame};
use kiln_tests::fixtures::{
    completed_cancelled, completed_failed, completed_ok, BuilderFixture, ChangeFixture,
};
use kiln_tests::helpers::{
    start_test_master, wait_for, ApiTestClient, TestWorker, TEST_CREDENTIAL,
};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_worker_handshake_registers() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");

    let (worker, reply) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    match reply {
        MasterFrame::Welcome { master: title, .. } => assert_eq!(title, "Kiln Test"),
        other => panic!("expected welcome, got {other:?}"),
    }

    let client = ApiTestClient::new(master.addr);
    let resp = client.get("/api/v1/workers").await.expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 1);
    assert_eq!(body["workers"][0]["name"], "forge-1");
    assert_eq!(body["workers"][0]["status"], "idle");
    assert_eq!(body["workers"][0]["platform"], "linux");

    worker.close().await.expect("Failed to close");
}

#[tokio::test]
async fn test_wrong_credential_is_denied() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");

    let (_worker, reply) = TestWorker::connect(master.addr, "intruder", "wrong-secret")
        .await
        .expect("Failed to connect worker");
    match reply {
        MasterFrame::Denied { reason } => {
            assert!(reason.contains("Authentication failed"), "reason: {reason}")
        }
        other => panic!("expected denial, got {other:?}"),
    }

    let client = ApiTestClient::new(master.addr);
    assert_eq!(client.worker_count().await.expect("Request failed"), 0);
}

#[tokio::test]
async fn test_duplicate_name_is_denied() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");

    let (_first, reply) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    assert!(matches!(reply, MasterFrame::Welcome { .. }));

    let (_second, reply) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    match reply {
        MasterFrame::Denied { reason } => {
            assert!(reason.contains("Duplicate worker"), "reason: {reason}")
        }
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn test_force_build_round_trip() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut worker, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    let order = worker.expect_assign().await.expect("no assignment");
    assert_eq!(order.builder.as_str(), "linux-x64-release");
    assert_eq!(order.attempt, 1);
    assert_eq!(order.steps.len(), 1);
    assert_eq!(order.steps[0].name, "greet");

    worker
        .send(&WorkerFrame::Started { request_id: order.request_id })
        .await
        .expect("Failed to send started");
    worker
        .send(&WorkerFrame::Completed(completed_ok(&order)))
        .await
        .expect("Failed to send completed");

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(5))
        .await
        .expect("build was never recorded");
    assert_eq!(build["outcome"], "succeeded");
    assert_eq!(build["number"], 1);
    assert_eq!(build["worker"], "forge-1");
    assert_eq!(build["request_id"], order.request_id.to_string());

    let resp = client
        .get("/status/badge?builder=linux-x64-release&number=1")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let svg = resp.text().await.expect("Failed to read body");
    assert!(svg.contains(">passing<"), "unexpected badge: {svg}");

    // The worker is idle again once its report lands
    let freed = wait_for(Duration::from_secs(5), Duration::from_millis(50), || {
        let client = ApiTestClient::new(master.addr);
        async move {
            let Ok(resp) = client.get("/api/v1/workers").await else {
                return false;
            };
            let Ok(body) = resp.json::<serde_json::Value>().await else {
                return false;
            };
            body["workers"][0]["status"] == "idle"
        }
    })
    .await;
    assert!(freed, "worker never returned to idle");
}

#[tokio::test]
async fn test_single_worker_drains_a_fanned_out_change() {
    let master = start_test_master(vec![
        BuilderFixture::echo("linux-x64-debug"),
        BuilderFixture::echo("linux-x64-release"),
    ])
    .await
    .expect("Failed to start master");
    let (mut worker, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed_json("/api/v1/changes", &ChangeFixture::push())
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // One build at a time: the second assignment only lands after the
    // first report does.
    let first = worker.expect_assign().await.expect("no first assignment");
    worker
        .send(&WorkerFrame::Started { request_id: first.request_id })
        .await
        .expect("Failed to send started");
    worker
        .send(&WorkerFrame::Completed(completed_ok(&first)))
        .await
        .expect("Failed to send completed");

    let second = worker.expect_assign().await.expect("no second assignment");
    assert_ne!(first.builder, second.builder);
    assert_ne!(first.request_id, second.request_id);
    worker
        .send(&WorkerFrame::Started { request_id: second.request_id })
        .await
        .expect("Failed to send started");
    worker
        .send(&WorkerFrame::Completed(completed_ok(&second)))
        .await
        .expect("Failed to send completed");

    for builder in ["linux-x64-debug", "linux-x64-release"] {
        let build = client
            .wait_for_build(builder, 1, Duration::from_secs(5))
            .await
            .expect("build was never recorded");
        assert_eq!(build["outcome"], "succeeded");
    }
}

#[tokio::test]
async fn test_failed_build_reports_failing_badge() {
    let master = start_test_master(vec![BuilderFixture::failing("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut worker, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    let order = worker.expect_assign().await.expect("no assignment");
    worker
        .send(&WorkerFrame::Started { request_id: order.request_id })
        .await
        .expect("Failed to send started");
    worker
        .send(&WorkerFrame::Completed(completed_failed(&order)))
        .await
        .expect("Failed to send completed");

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(5))
        .await
        .expect("build was never recorded");
    assert_eq!(build["outcome"], "failed");

    let resp = client
        .get("/status/badge?builder=linux-x64-release&number=1")
        .await
        .expect("Request failed");
    let svg = resp.text().await.expect("Failed to read body");
    assert!(svg.contains(">failing<"), "unexpected badge: {svg}");
}

#[tokio::test]
async fn test_lost_worker_requeues_to_another() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut first, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    let order = first.expect_assign().await.expect("no assignment");
    first
        .send(&WorkerFrame::Started { request_id: order.request_id })
        .await
        .expect("Failed to send started");

    // The connection dies mid-build
    drop(first);

    let (mut second, _) = TestWorker::connect(master.addr, "forge-2", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let retried = second.expect_assign().await.expect("request was not requeued");
    assert_eq!(retried.request_id, order.request_id);
    assert_eq!(retried.attempt, 2);

    second
        .send(&WorkerFrame::Started { request_id: retried.request_id })
        .await
        .expect("Failed to send started");
    second
        .send(&WorkerFrame::Completed(completed_ok(&retried)))
        .await
        .expect("Failed to send completed");

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(5))
        .await
        .expect("build was never recorded");
    assert_eq!(build["outcome"], "succeeded");
    assert_eq!(build["worker"], "forge-2");
}

#[tokio::test]
async fn test_cancel_running_build() {
    let master = start_test_master(vec![BuilderFixture::slow("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut worker, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    let request_id = body["request_id"].as_str().expect("missing request id").to_string();

    let order = worker.expect_assign().await.expect("no assignment");
    worker
        .send(&WorkerFrame::Started { request_id: order.request_id })
        .await
        .expect("Failed to send started");

    let resp = client
        .post_authed(&format!("/api/v1/requests/{request_id}/cancel"))
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let cancelled_id = worker.expect_cancel().await.expect("no cancellation");
    assert_eq!(cancelled_id, order.request_id);
    worker
        .send(&WorkerFrame::Completed(completed_cancelled(&order)))
        .await
        .expect("Failed to send completed");

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(5))
        .await
        .expect("build was never recorded");
    assert_eq!(build["outcome"], "cancelled");
}

#[tokio::test]
async fn test_mismatched_capabilities_leave_request_queued() {
    let master = start_test_master(vec![BuilderFixture::windows_only("windows-x64-release")])
        .await
        .expect("Failed to start master");
    let (_worker, reply) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    assert!(matches!(reply, MasterFrame::Welcome { .. }));
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/windows-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Plenty of ticks pass; the Linux worker never qualifies.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let resp = client.get("/api/v1/requests").await.expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 1);
    assert_eq!(body["requests"][0]["phase"], "queued");
}

#[tokio::test]
async fn test_unacknowledged_assignment_is_retried() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut worker, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Ignore the first assignment; the ack window lapses and the master
    // offers the request again.
    let first = worker.expect_assign().await.expect("no first assignment");
    assert_eq!(first.attempt, 1);

    let retried = worker.expect_assign().await.expect("no second assignment");
    assert_eq!(retried.request_id, first.request_id);
    assert_eq!(retried.attempt, 2);

    worker
        .send(&WorkerFrame::Started { request_id: retried.request_id })
        .await
        .expect("Failed to send started");
    worker
        .send(&WorkerFrame::Completed(completed_ok(&retried)))
        .await
        .expect("Failed to send completed");

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(5))
        .await
        .expect("build was never recorded");
    assert_eq!(build["outcome"], "succeeded");
}

#[tokio::test]
async fn test_exhausted_retries_finalize_as_exception() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut worker, _) = TestWorker::connect(master.addr, "forge-1", TEST_CREDENTIAL)
        .await
        .expect("Failed to connect worker");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    for attempt in 1..=3 {
        let order = worker.expect_assign().await.expect("no assignment");
        assert_eq!(order.attempt, attempt);
        // Never acknowledge
    }

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(10))
        .await
        .expect("exception build was never recorded");
    assert_eq!(build["outcome"], "exception");

    let resp = client
        .get("/status/badge?builder=linux-x64-release&number=1")
        .await
        .expect("Request failed");
    let svg = resp.text().await.expect("Failed to read body");
    assert!(svg.contains(">error<"), "unexpected badge: {svg}");
}

#[tokio::test]
async fn test_event_stream_delivers_change_events() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let (mut events, _) = connect_async(&master.events_url())
        .await
        .expect("Failed to connect event stream");
    // Let the server-side subscription settle before publishing
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = ApiTestClient::new(master.addr);
    let resp = client
        .post_authed_json("/api/v1/changes", &ChangeFixture::push())
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let mut subjects = Vec::new();
    for _ in 0..5 {
        let message = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream closed")
            .expect("event stream error");
        if let Message::Text(text) = message {
            let event: Event = serde_json::from_str(&text).expect("Failed to parse event");
            subjects.push(event.subject());
            if subjects.iter().any(|s| s.starts_with("change.accepted")) {
                break;
            }
        }
    }
    assert!(
        subjects.iter().any(|s| s.starts_with("build.queued")),
        "saw: {subjects:?}"
    );
    assert!(
        subjects.iter().any(|s| s.starts_with("change.accepted")),
        "saw: {subjects:?}"
    );
}

#[tokio::test]
async fn test_event_stream_honours_subject_pattern() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let url = format!("{}?pattern=build.queued.%3E", master.events_url());
    let (mut events, _) = connect_async(&url)
        .await
        .expect("Failed to connect event stream");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = ApiTestClient::new(master.addr);
    let resp = client
        .post_authed_json("/api/v1/changes", &ChangeFixture::push())
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let message = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
        .expect("event stream error");
    let Message::Text(text) = message else {
        panic!("expected a text frame");
    };
    let event: Event = serde_json::from_str(&text).expect("Failed to parse event");
    assert!(
        event.subject().starts_with("build.queued."),
        "subject: {}",
        event.subject()
    );
}

#[tokio::test]
async fn test_real_worker_runs_an_echo_build() {
    let workspace = tempfile::tempdir().expect("Failed to create workspace");
    let config = kiln_worker::WorkerConfig {
        name: "forge-real".to_string(),
        master_url: String::new(),
        credential: TEST_CREDENTIAL.to_string(),
        tags: vec![],
        workspace_dir: workspace.path().to_path_buf(),
        heartbeat_interval_secs: 1,
    };

    // Pin the builder requirement to whatever this host detects so the
    // build is assignable anywhere the test runs.
    let caps = config.capabilities();
    let mut builder = BuilderFixture::echo("native-echo");
    builder.requires = CapabilityRequirement {
        platform: caps.platform,
        arch: caps.arch,
        tags: vec![],
    };

    let master = start_test_master(vec![builder])
        .await
        .expect("Failed to start master");
    let config = kiln_worker::WorkerConfig {
        master_url: master.worker_url(),
        ..config
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let connection = kiln_worker::WorkerConnection::new(config);
    let worker_task = tokio::spawn(async move {
        connection.run(shutdown_rx).await;
    });

    let client = ApiTestClient::new(master.addr);
    let registered = wait_for(Duration::from_secs(5), Duration::from_millis(50), || {
        let client = ApiTestClient::new(master.addr);
        async move { client.worker_count().await.unwrap_or(0) == 1 }
    })
    .await;
    assert!(registered, "worker never registered");

    let resp = client
        .post_authed("/api/v1/builders/native-echo/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);

    let build = client
        .wait_for_build("native-echo", 1, Duration::from_secs(10))
        .await
        .expect("build was never recorded");
    assert_eq!(build["outcome"], "succeeded");
    assert_eq!(build["worker"], "forge-real");
    let tail = build["steps"][0]["log_tail"]
        .as_array()
        .expect("missing log tail");
    assert!(
        tail.iter()
            .any(|line| line.as_str().unwrap_or("").contains("hello from kiln")),
        "tail: {tail:?}"
    );

    let _ = shutdown_tx.send(true);
    let _ = worker_task.await;
}
