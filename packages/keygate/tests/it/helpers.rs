//! Shared fixture: a real server on a loopback port, wired to a manual clock.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    extract::Query,
    routing::any,
};
use color_eyre::Result;
use keygate::{
    api,
    auth::UserId,
    crypto::SessionKeys,
    gate::Gate,
    policy::PolicyTable,
    quota::{ManualClock, MemoryCounters, QuotaTracker},
    store::Store,
    upstream::Upstream,
};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use url::Url;

const SESSION_SECRET: &str = "integration-test-session-secret";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestFixture {
    pub base_url: Url,
    pub store: Store,
    pub clock: ManualClock,
    pub sessions: SessionKeys,
    pub client: reqwest::Client,
}

impl TestFixture {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with_policy(PolicyTable::default()).await
    }

    /// Spawn with rule overrides, in the same TOML format the server loads.
    pub async fn spawn_with_policy_toml(policy: &str) -> Result<Self> {
        Self::spawn_with_policy(PolicyTable::from_toml(policy)?).await
    }

    pub async fn spawn_with_policy(policy: PolicyTable) -> Result<Self> {
        let store = Store::default();
        let start = OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1_800_000_000);
        let clock = ManualClock::new(start);
        let sessions = SessionKeys::from_secret(SESSION_SECRET)?;
        let quota = QuotaTracker::new(MemoryCounters::default(), clock.clone());
        let gate = Gate::new(policy, quota, store.clone(), sessions.clone());
        let upstream = Upstream::new(UPSTREAM_TIMEOUT)?;
        let app = api::router(api::state(store.clone(), upstream), &gate, UPSTREAM_TIMEOUT);

        let base_url = serve(app).await?;
        Ok(Self {
            base_url,
            store,
            clock,
            sessions,
            client: reqwest::Client::new(),
        })
    }

    /// A valid session token for `user`.
    pub fn session(&self, user: &str) -> String {
        let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(3600);
        self.sessions
            .mint(&UserId::new(user), expires_at)
            .expect("mint session token")
            .as_str()
            .to_string()
    }

    /// A request from `ip`, as reported by a proxy.
    pub fn request(&self, method: reqwest::Method, path: &str, ip: &str) -> RequestBuilder {
        let url = self.base_url.join(path).expect("join test path");
        self.client
            .request(method, url)
            .header("x-forwarded-for", ip)
    }

    pub fn get(&self, path: &str, ip: &str) -> RequestBuilder {
        self.request(reqwest::Method::GET, path, ip)
    }

    pub fn post(&self, path: &str, ip: &str) -> RequestBuilder {
        self.request(reqwest::Method::POST, path, ip)
    }

    pub fn delete(&self, path: &str, ip: &str) -> RequestBuilder {
        self.request(reqwest::Method::DELETE, path, ip)
    }

    /// Register an API for `user` and return its id.
    pub async fn create_api(&self, user: &str, base_url: &str) -> Result<String> {
        let response = self
            .post("api/apis", "10.0.0.1")
            .bearer_auth(self.session(user))
            .json(&json!({ "name": "test api", "base_url": base_url, "method": "POST" }))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.json::<Value>().await?;
        Ok(body["id"].as_str().expect("api id").to_string())
    }

    /// Issue an API key for `user`.
    pub async fn create_key(&self, user: &str) -> Result<String> {
        let response = self
            .post("api/keys", "10.0.0.1")
            .bearer_auth(self.session(user))
            .json(&json!({ "name": "test key" }))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.json::<Value>().await?;
        Ok(body["key"].as_str().expect("api key").to_string())
    }
}

/// Spawn an upstream that echoes what it received.
pub async fn spawn_upstream() -> Result<Url> {
    async fn echo(
        Query(query): Query<BTreeMap<String, String>>,
        body: Option<Json<Value>>,
    ) -> Json<Value> {
        Json(json!({ "query": query, "body": body.map(|Json(body)| body) }))
    }

    let app = Router::new()
        .route("/v1/{*rest}", any(echo))
        .route("/v1/", any(echo))
        .route(
            "/teapot",
            any(|| async { (axum::http::StatusCode::IM_A_TEAPOT, "short and stout") }),
        );
    serve(app).await
}

async fn serve(app: Router) -> Result<Url> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("serve test app");
    });
    Ok(Url::parse(&format!("http://{addr}/"))?)
}
