//! Session introspection endpoints.
//!
//! Sessions are minted out of band (`keygate mint-token`); these endpoints
//! only report what the gate resolved for the caller.

use axum::{Extension, Json, Router, routing::get};
use serde::Serialize;

use crate::{
    api::State,
    auth::{Identity, SessionUser, UserId},
};

pub fn router() -> Router<State> {
    Router::new()
        .route("/me", get(me))
        .route("/identity", get(identity))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user_id: UserId,
}

/// The authenticated user.
///
/// ## Endpoint
/// ```text
/// GET /api/auth/me
/// Authorization: Bearer <session_token>
/// ```
///
/// ## Responses
/// - 200: The session's user
/// - 401: No valid session
#[tracing::instrument]
pub async fn me(SessionUser(user_id): SessionUser) -> Json<MeResponse> {
    Json(MeResponse { user_id })
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityResponse {
    User { user_id: UserId, key: String },
    Anonymous { key: String },
}

/// The identity the caller's quota is counted against. Mainly useful for
/// checking what a client's session and proxy headers resolve to.
///
/// ## Endpoint
/// ```text
/// GET /api/auth/identity
/// ```
#[tracing::instrument]
pub async fn identity(Extension(identity): Extension<Identity>) -> Json<IdentityResponse> {
    let key = identity.key();
    Json(match identity {
        Identity::User(user_id) => IdentityResponse::User { user_id, key },
        Identity::Anonymous(_) => IdentityResponse::Anonymous { key },
    })
}
