//! The execute path: proxy a call to a registered API.
//!
//! Authorized by API key rather than session. The gate has already checked
//! the key by the time the handler runs; the handler only has to check that
//! the key's owner registered the API. Every call that reaches the upstream,
//! successful or not, is written to the call log.

use std::time::Instant;

use aerosol::axum::Dep;
use axum::{Json, Router, extract::Path, http::StatusCode, response::IntoResponse, routing::post};
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    api::State,
    auth::ApiCaller,
    store::{CallLog, Store},
    upstream::{ExecuteRequest, Upstream},
};

pub fn router() -> Router<State> {
    Router::new().route("/{api_id}", post(execute))
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub status: u16,
    pub body: Value,
    pub latency_ms: u64,
}

/// Call a registered API on behalf of the key's owner.
///
/// ## Endpoint
/// ```text
/// POST /api/execute/{api_id}
/// X-API-Key: <api_key>
/// Content-Type: application/json
///
/// { "path": "forecast", "query": { "city": "Oslo" }, "body": null }
/// ```
///
/// The request body is optional; an empty body calls the base URL as is.
///
/// ## Responses
/// - 200: The upstream answered; its status and body are in the response
/// - 400: The path or query doesn't form a valid URL
/// - 401: Missing, unknown, or inactive API key
/// - 404: No such API for the key's owner
/// - 502: The upstream couldn't be reached
#[tracing::instrument(skip(store, upstream, request))]
pub async fn execute(
    Dep(store): Dep<Store>,
    Dep(upstream): Dep<Upstream>,
    caller: ApiCaller,
    Path(api_id): Path<Uuid>,
    request: Option<Json<ExecuteRequest>>,
) -> ExecuteApiResponse {
    let request = request.map(|Json(request)| request).unwrap_or_default();

    let Some(api) = store.get_api(&caller.owner, api_id) else {
        warn!(owner = %caller.owner, %api_id, "execute.api.not_found");
        return ExecuteApiResponse::NotFound;
    };

    let url = match Upstream::url(&api, &request) {
        Ok(url) => url,
        Err(err) => {
            warn!(?err, %api_id, "execute.url.invalid");
            return ExecuteApiResponse::BadRequest(err.to_string());
        }
    };

    let started = Instant::now();
    let result = upstream.call(api.method.clone(), url.clone(), &request).await;
    let latency_ms = u64::try_from(started.elapsed().as_millis())
            .unwrap_or(u64::MAX);

    let mut log = CallLog {
        id: Uuid::new_v4(),
        api_id,
        owner: caller.owner.clone(),
        method: api.method,
        url: url.to_string(),
        status: None,
        latency_ms,
        error: None,
        timestamp: OffsetDateTime::now_utc(),
    };

    match result {
        Ok(response) => {
            log.status = Some(response.status);
            store.record_call(log);
            info!(%api_id, status = response.status, latency_ms, "execute.success");
            ExecuteApiResponse::Success(ExecuteResponse {
                status: response.status,
                body: response.body,
                latency_ms,
            })
        }
        Err(err) => {
            error!(?err, %api_id, latency_ms, "execute.upstream.error");
            log.error = Some(format!("{err:#}"));
            store.record_call(log);
            ExecuteApiResponse::BadGateway(format!("{err:#}"))
        }
    }
}

#[derive(Debug)]
pub enum ExecuteApiResponse {
    Success(ExecuteResponse),
    BadRequest(String),
    NotFound,
    BadGateway(String),
}

impl IntoResponse for ExecuteApiResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            ExecuteApiResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            ExecuteApiResponse::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ExecuteApiResponse::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "API not found" }))).into_response()
            }
            ExecuteApiResponse::BadGateway(msg) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "Upstream request failed", "message": msg })),
            )
                .into_response(),
        }
    }
}
