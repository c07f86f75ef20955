//! API key management endpoints.
//!
//! Keys are issued to the session user and presented on the execute path in
//! the `X-API-Key` header. Keys are deactivated, never deleted.

use aerosol::axum::Dep;
use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{api::State, auth::SessionUser, keys::ApiKeyRecord, store::Store};

pub fn router() -> Router<State> {
    Router::new()
        .route("/", post(create_key).get(list_keys))
        .route("/{key}", delete(deactivate_key))
}

#[derive(Debug, Serialize)]
pub struct KeyResponse {
    pub key: String,
    pub name: String,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<ApiKeyRecord> for KeyResponse {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            key: record.key,
            name: record.name,
            is_active: record.is_active,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateKeyRequest {
    pub name: Option<String>,
}

/// Issue a new API key.
///
/// ## Endpoint
/// ```text
/// POST /api/keys
/// Authorization: Bearer <session_token>
/// Content-Type: application/json
///
/// { "name": "ci" }
/// ```
///
/// ## Responses
/// - 201: The new key
/// - 401: Not authenticated
#[tracing::instrument(skip(store))]
pub async fn create_key(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
    Json(request): Json<CreateKeyRequest>,
) -> CreateKeyResponse {
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("default");
    let record = store.create_api_key(&user, name);
    info!(user = %user, name, "keys.create.success");
    CreateKeyResponse::Created(record.into())
}

#[derive(Debug)]
pub enum CreateKeyResponse {
    Created(KeyResponse),
}

impl IntoResponse for CreateKeyResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            CreateKeyResponse::Created(key) => (StatusCode::CREATED, Json(key)).into_response(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct KeyListResponse {
    pub keys: Vec<KeyResponse>,
}

/// List the session user's keys, including deactivated ones.
#[tracing::instrument(skip(store))]
pub async fn list_keys(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
) -> Json<KeyListResponse> {
    let keys = store
        .list_api_keys(&user)
        .into_iter()
        .map(KeyResponse::from)
        .collect();
    Json(KeyListResponse { keys })
}

/// Deactivate a key. The execute path rejects it from then on.
///
/// ## Endpoint
/// ```text
/// DELETE /api/keys/{key}
/// Authorization: Bearer <session_token>
/// ```
///
/// ## Responses
/// - 204: Deactivated
/// - 404: No such key for this user
#[tracing::instrument(skip(store, key))]
pub async fn deactivate_key(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
    Path(key): Path<String>,
) -> DeactivateKeyResponse {
    if store.deactivate_api_key(&user, &key) {
        info!(user = %user, "keys.deactivate.success");
        DeactivateKeyResponse::Deactivated
    } else {
        warn!(user = %user, "keys.deactivate.not_found");
        DeactivateKeyResponse::NotFound
    }
}

#[derive(Debug)]
pub enum DeactivateKeyResponse {
    Deactivated,
    NotFound,
}

impl IntoResponse for DeactivateKeyResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            DeactivateKeyResponse::Deactivated => StatusCode::NO_CONTENT.into_response(),
            DeactivateKeyResponse::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "API key not found" })),
            )
                .into_response(),
        }
    }
}
