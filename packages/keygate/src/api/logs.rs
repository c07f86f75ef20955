//! Call log endpoints.

use aerosol::axum::Dep;
use axum::{Json, Router, extract::Query, routing::get};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    api::State,
    auth::SessionUser,
    store::{CallLog, Store},
};

pub fn router() -> Router<State> {
    Router::new().route("/", get(list_logs))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub api_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub id: Uuid,
    pub api_id: Uuid,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<CallLog> for LogResponse {
    fn from(log: CallLog) -> Self {
        Self {
            id: log.id,
            api_id: log.api_id,
            method: log.method.to_string(),
            url: log.url,
            status: log.status,
            latency_ms: log.latency_ms,
            error: log.error,
            timestamp: log.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogListResponse {
    pub logs: Vec<LogResponse>,
}

/// The session user's calls through the execute path, newest first.
///
/// ## Endpoint
/// ```text
/// GET /api/logs?api_id=<uuid>
/// Authorization: Bearer <session_token>
/// ```
#[tracing::instrument(skip(store))]
pub async fn list_logs(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
    Query(query): Query<LogQuery>,
) -> Json<LogListResponse> {
    let logs = store
        .list_logs(&user, query.api_id)
        .into_iter()
        .map(LogResponse::from)
        .collect();
    Json(LogListResponse { logs })
}
