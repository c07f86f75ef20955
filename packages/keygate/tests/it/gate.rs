//! Rate limiting and authorization as seen by HTTP clients.

use std::time::Duration;

use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use reqwest::{StatusCode, header::RETRY_AFTER};
use serde_json::{Value, json};

use crate::helpers::TestFixture;

const TIGHT_AUTH: &str = r#"
[groups.auth]
limit = "3 per minute"
"#;

#[test_log::test(tokio::test)]
async fn group_quota_rejects_past_ceiling() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(TIGHT_AUTH).await?;
    let token = fixture.session("alice");

    for remaining in [2, 1, 0] {
        let response = fixture
            .get("api/auth/me", "203.0.113.7")
            .bearer_auth(&token)
            .send()
            .await?;
        pretty_assert_eq!(response.status(), StatusCode::OK);
        pretty_assert_eq!(
            response.headers()["x-ratelimit-remaining"].to_str()?,
            remaining.to_string()
        );
    }

    let response = fixture
        .get("api/auth/me", "203.0.113.7")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    pretty_assert_eq!(response.headers()[RETRY_AFTER].to_str()?, "60");
    pretty_assert_eq!(response.headers()["x-ratelimit-limit"].to_str()?, "3");
    pretty_assert_eq!(response.headers()["x-ratelimit-remaining"].to_str()?, "0");
    pretty_assert_eq!(response.headers()["x-ratelimit-reset"].to_str()?, "60");
    let body = response.json::<Value>().await?;
    pretty_assert_eq!(
        body,
        json!({
            "error": "Too many requests",
            "message": "Rate limit exceeded. Please try again later.",
        })
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn window_reset_admits_again() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(TIGHT_AUTH).await?;
    let token = fixture.session("alice");

    for _ in 0..3 {
        fixture
            .get("api/auth/me", "203.0.113.7")
            .bearer_auth(&token)
            .send()
            .await?;
    }

    fixture.clock.advance(Duration::from_secs(30));
    let response = fixture
        .get("api/auth/me", "203.0.113.7")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    pretty_assert_eq!(response.headers()[RETRY_AFTER].to_str()?, "30");

    fixture.clock.advance(Duration::from_secs(30));
    let response = fixture
        .get("api/auth/me", "203.0.113.7")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn quotas_are_per_client_ip() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(TIGHT_AUTH).await?;

    for _ in 0..3 {
        fixture.get("api/auth/identity", "203.0.113.7").send().await?;
    }
    let exhausted = fixture.get("api/auth/identity", "203.0.113.7").send().await?;
    pretty_assert_eq!(exhausted.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = fixture.get("api/auth/identity", "198.51.100.2").send().await?;
    pretty_assert_eq!(other.status(), StatusCode::OK);
    pretty_assert_eq!(
        other.json::<Value>().await?,
        json!({ "kind": "anonymous", "key": "ip:198.51.100.2" })
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn groups_have_independent_quotas() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(TIGHT_AUTH).await?;
    let token = fixture.session("alice");

    for _ in 0..4 {
        fixture
            .get("api/auth/me", "203.0.113.7")
            .bearer_auth(&token)
            .send()
            .await?;
    }

    let response = fixture
        .get("api/apis", "203.0.113.7")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn global_quota_spans_groups() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(
        r#"
        [global]
        limit = "2 per hour"
        "#,
    )
    .await?;
    let token = fixture.session("alice");

    let first = fixture.get("health", "203.0.113.7").send().await?;
    pretty_assert_eq!(first.status(), StatusCode::OK);
    let second = fixture
        .get("api/apis", "203.0.113.7")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(second.status(), StatusCode::OK);

    let third = fixture
        .get("api/logs", "203.0.113.7")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    pretty_assert_eq!(third.headers()[RETRY_AFTER].to_str()?, "3600");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn identity_keyed_group_follows_user_across_addresses() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(
        r#"
        [groups.auth]
        limit = "2 per minute"
        key = "identity"
        "#,
    )
    .await?;
    let token = fixture.session("alice");

    for ip in ["203.0.113.7", "198.51.100.2"] {
        let response = fixture
            .get("api/auth/me", ip)
            .bearer_auth(&token)
            .send()
            .await?;
        pretty_assert_eq!(response.status(), StatusCode::OK);
    }
    let response = fixture
        .get("api/auth/me", "192.0.2.44")
        .bearer_auth(&token)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Another user from the same address still has quota.
    let response = fixture
        .get("api/auth/me", "192.0.2.44")
        .bearer_auth(fixture.session("bob"))
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn invalid_session_is_anonymous() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .get("api/auth/identity", "203.0.113.7")
        .bearer_auth("not-a-token")
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::OK);
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "kind": "anonymous", "key": "ip:203.0.113.7" })
    );

    let response = fixture
        .get("api/auth/me", "203.0.113.7")
        .bearer_auth("not-a-token")
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "error": "Authentication required" })
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn session_resolves_to_user_identity() -> Result<()> {
    let fixture = TestFixture::spawn().await?;

    let response = fixture
        .get("api/auth/identity", "203.0.113.7")
        .bearer_auth(fixture.session("alice"))
        .send()
        .await?;
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "kind": "user", "user_id": "alice", "key": "user:alice" })
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn execute_requires_api_key() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let api_id = fixture.create_api("alice", "http://127.0.0.1:9/").await?;
    let path = format!("api/execute/{api_id}");

    let response = fixture.post(&path, "203.0.113.7").send().await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "error": "API key is required" })
    );

    let response = fixture
        .post(&path, "203.0.113.7")
        .header("x-api-key", "0123456789abcdefghijklmnopqrstuv")
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "error": "Invalid or inactive API key" })
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn deactivated_key_is_rejected() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let api_id = fixture.create_api("alice", "http://127.0.0.1:9/").await?;
    let key = fixture.create_key("alice").await?;

    let response = fixture
        .delete(&format!("api/keys/{key}"), "203.0.113.7")
        .bearer_auth(fixture.session("alice"))
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = fixture
        .post(&format!("api/execute/{api_id}"), "203.0.113.7")
        .header("x-api-key", &key)
        .send()
        .await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    pretty_assert_eq!(
        response.json::<Value>().await?,
        json!({ "error": "Invalid or inactive API key" })
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn quota_is_checked_before_api_key() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(
        r#"
        [groups.execute]
        limit = "1 per minute"
        "#,
    )
    .await?;
    let api_id = fixture.create_api("alice", "http://127.0.0.1:9/").await?;
    let path = format!("api/execute/{api_id}");

    let response = fixture.post(&path, "203.0.113.7").send().await?;
    pretty_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = fixture.post(&path, "203.0.113.7").send().await?;
    pretty_assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn unmatched_paths_are_not_gated() -> Result<()> {
    let fixture = TestFixture::spawn_with_policy_toml(
        r#"
        [global]
        limit = "1 per hour"
        "#,
    )
    .await?;

    for _ in 0..3 {
        let response = fixture.get("nope", "203.0.113.7").send().await?;
        pretty_assert_eq!(response.status(), StatusCode::NOT_FOUND);
        pretty_assert_eq!(
            response.json::<Value>().await?,
            json!({ "error": "Resource not found" })
        );
    }

    Ok(())
}
