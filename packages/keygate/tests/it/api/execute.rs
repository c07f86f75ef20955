//! Integration tests for the execute path.

use color_eyre::Result;
use keygate::auth::UserId;
use pretty_assertions::assert_eq as pretty_assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::helpers::{TestFixture, spawn_upstream};

#[test_log::test(tokio::test)]
async fn execute_proxies_to_upstream() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let upstream = spawn_upstream().await?;
    let api_id = fixture
        .create_api("alice", upstream.join("v1/")?.as_str())
        .await?;
    let key = fixture.create_key("alice").await?;

    let response = fixture
        .post(&format!("api/execute/{api_id}"), "203.0.113.7")
        .header("x-api-key", &key)
        .json(&json!({
            "path": "/forecast",
            "query": { "city": "Oslo" },
            "body": { "days": 3 },
        }))
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    let body = response.json::<Value>().await?;
    pretty_assert_eq!(body["status"], 200);
    pretty_assert_eq!(
        body["body"],
        json!({ "query": { "city": "Oslo" }, "body": { "days": 3 } })
    );

    let logs = fixture.store.list_logs(&UserId::new("alice"), None);
    pretty_assert_eq!(logs.len(), 1);
    pretty_assert_eq!(logs[0].status, Some(200));
    pretty_assert_eq!(logs[0].error, None);
    assert!(logs[0].url.ends_with("/v1/forecast?city=Oslo"), "{}", logs[0].url);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn execute_without_body_calls_base_url() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let upstream = spawn_upstream().await?;
    let api_id = fixture
        .create_api("alice", upstream.join("v1/")?.as_str())
        .await?;
    let key = fixture.create_key("alice").await?;

    let response = fixture
        .post(&format!("api/execute/{api_id}"), "203.0.113.7")
        .header("x-api-key", &key)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await?;
    pretty_assert_eq!(body["body"], json!({ "query": {}, "body": null }));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn upstream_errors_are_passed_through() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let upstream = spawn_upstream().await?;
    let api_id = fixture
        .create_api("alice", upstream.join("teapot")?.as_str())
        .await?;
    let key = fixture.create_key("alice").await?;

    let response = fixture
        .post(&format!("api/execute/{api_id}"), "203.0.113.7")
        .header("x-api-key", &key)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await?;
    pretty_assert_eq!(body["status"], 418);
    pretty_assert_eq!(body["body"], "short and stout");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn unreachable_upstream_is_bad_gateway() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let api_id = fixture.create_api("alice", "http://127.0.0.1:9/").await?;
    let key = fixture.create_key("alice").await?;

    let response = fixture
        .post(&format!("api/execute/{api_id}"), "203.0.113.7")
        .header("x-api-key", &key)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    pretty_assert_eq!(
        response.json::<Value>().await?["error"],
        "Upstream request failed"
    );

    let logs = fixture.store.list_logs(&UserId::new("alice"), None);
    pretty_assert_eq!(logs.len(), 1);
    pretty_assert_eq!(logs[0].status, None);
    assert!(logs[0].error.is_some());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn other_users_api_is_not_found() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let api_id = fixture.create_api("alice", "http://127.0.0.1:9/").await?;
    let key = fixture.create_key("bob").await?;

    let response = fixture
        .post(&format!("api/execute/{api_id}"), "203.0.113.7")
        .header("x-api-key", &key)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(fixture.store.list_logs(&UserId::new("bob"), None).is_empty());

    Ok(())
}
