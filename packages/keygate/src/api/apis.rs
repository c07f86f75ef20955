//! Registered API endpoints.
//!
//! A user registers the external APIs they want to call through the execute
//! path. Every endpoint here is scoped to the session user: other users'
//! APIs are indistinguishable from missing ones.

use aerosol::axum::Dep;
use axum::{
    Json, Router,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    api::State,
    auth::SessionUser,
    store::{ApiRecord, NewApi, Store},
    upstream::parse_method,
};

pub fn router() -> Router<State> {
    Router::new()
        .route("/", post(create_api).get(list_apis))
        .route("/{api_id}", get(get_api).delete(delete_api))
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<ApiRecord> for ApiResponse {
    fn from(api: ApiRecord) -> Self {
        Self {
            id: api.id,
            name: api.name,
            base_url: api.base_url.to_string(),
            method: api.method.to_string(),
            description: api.description,
            created_at: api.created_at,
        }
    }
}

// =============================================================================
// Create API
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateApiRequest {
    pub name: String,
    pub base_url: String,

    /// Defaults to `GET`.
    pub method: Option<String>,
    pub description: Option<String>,
}

/// Register an external API.
///
/// ## Endpoint
/// ```text
/// POST /api/apis
/// Authorization: Bearer <session_token>
/// Content-Type: application/json
///
/// { "name": "weather", "base_url": "https://api.example.com/v1", "method": "GET" }
/// ```
///
/// ## Responses
/// - 201: API registered
/// - 400: Empty name, unparseable or non-HTTP URL, or unknown method
/// - 401: Not authenticated
#[tracing::instrument(skip(store))]
pub async fn create_api(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
    Json(request): Json<CreateApiRequest>,
) -> CreateApiResponse {
    let name = request.name.trim();
    if name.is_empty() {
        return CreateApiResponse::BadRequest(String::from("API name cannot be empty"));
    }

    let base_url = match Url::parse(request.base_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        Ok(url) => {
            warn!(scheme = url.scheme(), "apis.create.bad_scheme");
            return CreateApiResponse::BadRequest(String::from(
                "Base URL must use http or https",
            ));
        }
        Err(err) => {
            warn!(?err, "apis.create.bad_url");
            return CreateApiResponse::BadRequest(format!("Invalid base URL: {err}"));
        }
    };

    let method = match parse_method(request.method.as_deref().unwrap_or("GET")) {
        Ok(method) => method,
        Err(err) => return CreateApiResponse::BadRequest(err.to_string()),
    };

    let api = store.create_api(
        &user,
        NewApi {
            name: name.to_string(),
            base_url,
            method,
            description: request.description,
        },
    );
    info!(user = %user, api_id = %api.id, "apis.create.success");
    CreateApiResponse::Created(api.into())
}

#[derive(Debug)]
pub enum CreateApiResponse {
    Created(ApiResponse),
    BadRequest(String),
}

impl IntoResponse for CreateApiResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            CreateApiResponse::Created(api) => (StatusCode::CREATED, Json(api)).into_response(),
            CreateApiResponse::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
        }
    }
}

// =============================================================================
// List / get / delete
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiListResponse {
    pub apis: Vec<ApiResponse>,
}

/// List the session user's APIs, oldest first.
///
/// ## Endpoint
/// ```text
/// GET /api/apis
/// Authorization: Bearer <session_token>
/// ```
#[tracing::instrument(skip(store))]
pub async fn list_apis(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
) -> Json<ApiListResponse> {
    let apis = store
        .list_apis(&user)
        .into_iter()
        .map(ApiResponse::from)
        .collect::<Vec<_>>();
    info!(user = %user, count = apis.len(), "apis.list.success");
    Json(ApiListResponse { apis })
}

/// Fetch one API.
///
/// ## Responses
/// - 200: The API
/// - 404: No such API for this user
#[tracing::instrument(skip(store))]
pub async fn get_api(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
    Path(api_id): Path<Uuid>,
) -> ApiLookupResponse {
    match store.get_api(&user, api_id) {
        Some(api) => ApiLookupResponse::Found(api.into()),
        None => ApiLookupResponse::NotFound,
    }
}

/// Delete one API. Its call logs are kept.
///
/// ## Responses
/// - 204: Deleted
/// - 404: No such API for this user
#[tracing::instrument(skip(store))]
pub async fn delete_api(
    Dep(store): Dep<Store>,
    SessionUser(user): SessionUser,
    Path(api_id): Path<Uuid>,
) -> ApiLookupResponse {
    if store.delete_api(&user, api_id) {
        info!(user = %user, %api_id, "apis.delete.success");
        ApiLookupResponse::Deleted
    } else {
        ApiLookupResponse::NotFound
    }
}

#[derive(Debug)]
pub enum ApiLookupResponse {
    Found(ApiResponse),
    Deleted,
    NotFound,
}

impl IntoResponse for ApiLookupResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiLookupResponse::Found(api) => (StatusCode::OK, Json(api)).into_response(),
            ApiLookupResponse::Deleted => StatusCode::NO_CONTENT.into_response(),
            ApiLookupResponse::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "API not found" }))).into_response()
            }
        }
    }
}
