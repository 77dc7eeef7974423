//! API integration tests.
//!
//! Run with: `cargo test -p kiln-tests --test api_tests`

use kiln_core::ids::RequestId;
use kiln_tests::{
    fixtures::{BuilderFixture, ChangeFixture},
    helpers::{start_test_master, ApiTestClient},
};
use reqwest::StatusCode;
use std::time::Duration;

#[tokio::test]
async fn test_health_endpoint() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client.get("/health").await.expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["title"], "Kiln Test");
}

#[tokio::test]
async fn test_list_builders() {
    let master = start_test_master(vec![
        BuilderFixture::echo("linux-x64-release"),
        BuilderFixture::echo("linux-x64-debug"),
    ])
    .await
    .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client.get("/api/v1/builders").await.expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 2);
    // Builders list in name order
    assert_eq!(body["builders"][0]["name"], "linux-x64-debug");
    assert_eq!(body["builders"][1]["name"], "linux-x64-release");
}

#[tokio::test]
async fn test_get_builder_not_found() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .get("/api/v1/builders/ghost")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_badge_without_parameters_is_rejected() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client.get("/status/badge").await.expect("Request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = resp.text().await.expect("Failed to read body");
    assert_eq!(body, "builder and number parameter missing");

    let resp = client
        .get("/status/badge?builder=linux-x64-release")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = resp.text().await.expect("Failed to read body");
    assert_eq!(body, "builder and number parameter missing");
}

#[tokio::test]
async fn test_badge_unknown_builder() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .get("/status/badge?builder=ghost&number=1")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = resp.text().await.expect("Failed to read body");
    assert_eq!(body, "unknown builder");
}

#[tokio::test]
async fn test_badge_unknown_build_number() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .get("/status/badge?builder=linux-x64-release&number=7")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = resp.text().await.expect("Failed to read body");
    assert_eq!(body, "unknown build 7");
}

#[tokio::test]
async fn test_submit_change_fans_out_to_every_builder() {
    let master = start_test_master(vec![
        BuilderFixture::echo("linux-x64-release"),
        BuilderFixture::windows_only("windows-x64-release"),
    ])
    .await
    .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed_json("/api/v1/changes", &ChangeFixture::push())
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["branch"], "devel");
    assert_eq!(
        body["requests"].as_array().map(|r| r.len()),
        Some(2),
        "one request per configured builder"
    );

    let resp = client.get("/api/v1/requests").await.expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 2);
    assert_eq!(body["requests"][0]["phase"], "queued");
}

#[tokio::test]
async fn test_submit_change_missing_revision_is_rejected() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed_json("/api/v1/changes", &ChangeFixture::missing_revision())
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = resp.text().await.expect("Failed to read body");
    assert!(body.contains("revision"), "unexpected body: {body}");

    // Nothing was scheduled
    let resp = client.get("/api/v1/requests").await.expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_submit_change_requires_auth() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post("/api/v1/changes", &ChangeFixture::push())
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client.get("/api/v1/requests").await.expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 0, "rejected change must schedule nothing");
}

#[tokio::test]
async fn test_force_build_requires_auth() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post("/api/v1/builders/linux-x64-release/force", &serde_json::json!({}))
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_force_build_unknown_builder() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/ghost/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_force_build_queues_a_request() {
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert!(body["request_id"].as_str().is_some_and(|id| !id.is_empty()));

    let resp = client.get("/api/v1/requests").await.expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 1);
    assert_eq!(body["requests"][0]["request"]["builder"], "linux-x64-release");
}

#[tokio::test]
async fn test_cancel_unknown_request() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let path = format!("/api/v1/requests/{}/cancel", RequestId::new());
    let resp = client.post_authed(&path).await.expect("Request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_malformed_request_id() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/requests/not-a-request-id/cancel")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_queued_request_records_a_cancelled_build() {
    // No workers connected, so the forced request stays queued until the
    // cancel finalizes it.
    let master = start_test_master(vec![BuilderFixture::echo("linux-x64-release")])
        .await
        .expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client
        .post_authed("/api/v1/builders/linux-x64-release/force")
        .await
        .expect("Request failed");
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    let request_id = body["request_id"].as_str().expect("missing request id").to_string();

    let resp = client
        .post_authed(&format!("/api/v1/requests/{request_id}/cancel"))
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let build = client
        .wait_for_build("linux-x64-release", 1, Duration::from_secs(5))
        .await
        .expect("cancelled build was never recorded");
    assert_eq!(build["outcome"], "cancelled");
    assert_eq!(build["request_id"], request_id.as_str());

    let resp = client
        .get("/status/badge?builder=linux-x64-release&number=1")
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/svg+xml");
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    let svg = resp.text().await.expect("Failed to read body");
    assert!(svg.contains(">cancelled<"), "unexpected badge: {svg}");
}

#[tokio::test]
async fn test_list_workers_empty() {
    let master = start_test_master(vec![]).await.expect("Failed to start master");
    let client = ApiTestClient::new(master.addr);

    let resp = client.get("/api/v1/workers").await.expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.expect("Failed to parse JSON");
    assert_eq!(body["total"], 0);
}
