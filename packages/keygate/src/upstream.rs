//! Outbound calls to registered APIs.

use std::{collections::BTreeMap, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::store::ApiRecord;

/// The caller-controlled part of a proxied call.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecuteRequest {
    /// Appended to the API's base URL.
    pub path: Option<String>,

    /// Added to the URL's query string.
    pub query: BTreeMap<String, String>,

    /// Sent as the JSON request body.
    pub body: Option<Value>,
}

/// What the upstream API answered.
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,

    /// The response body: JSON when it parses, otherwise a string.
    pub body: Value,
}

/// HTTP client used for the execute path.
#[derive(Clone, Debug)]
pub struct Upstream {
    client: reqwest::Client,
}

impl Upstream {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build upstream http client")?;
        Ok(Self { client })
    }

    /// The full URL a request resolves to for `api`.
    pub fn url(api: &ApiRecord, request: &ExecuteRequest) -> Result<Url> {
        let mut url = match request.path.as_deref().map(|path| path.trim_start_matches('/')) {
            Some(path) if !path.is_empty() => {
                let base = api.base_url.as_str().trim_end_matches('/');
                Url::parse(&format!("{base}/{path}"))
                    .with_context(|| format!("join {path:?} onto {}", api.base_url))?
            }
            _ => api.base_url.clone(),
        };
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    /// Make the call. Non-2xx answers are responses, not errors; only
    /// transport failures error.
    #[tracing::instrument(name = "Upstream::call", skip(self, request))]
    pub async fn call(
        &self,
        method: http::Method,
        url: Url,
        request: &ExecuteRequest,
    ) -> Result<UpstreamResponse> {
        let mut outbound = self.client.request(method, url.clone());
        if let Some(body) = &request.body {
            outbound = outbound.json(body);
        }

        let response = outbound
            .send()
            .await
            .with_context(|| format!("send request to {url}"))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .with_context(|| format!("read response body from {url}"))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(UpstreamResponse { status, body })
    }
}

/// Parse an HTTP method name as given by a user.
pub fn parse_method(method: &str) -> Result<http::Method> {
    let method = method.trim().to_ascii_uppercase();
    http::Method::from_bytes(method.as_bytes()).map_err(|_| eyre!("invalid http method {method:?}"))
}
