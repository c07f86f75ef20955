//! Caller identity: who a request counts against, and who it acts for.
//!
//! Authentication is optional at the gate. A request carrying a valid
//! bearer session token resolves to [`Identity::User`]; anything else
//! (no header, a malformed header, an expired or forged token) quietly
//! resolves to [`Identity::Anonymous`] keyed by the caller's IP. Routes that
//! actually require a user extract [`SessionUser`], which rejects anonymous
//! callers.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderMap, Request, StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use derive_more::{Debug, Display, From};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_governor::key_extractor::{KeyExtractor, SmartIpKeyExtractor};
use tracing::debug;

/// An opaque id for a user, as carried in session tokens.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize, From)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// An unauthenticated token from the `Authorization` header.
///
/// These are provided by the client and have not been verified. To verify a
/// token, hand it to a [`TokenVerifier`].
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[debug("RawToken(..)")]
pub struct RawToken(String);

impl RawToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// View the token as a string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Read a bearer token from request headers.
    ///
    /// The `Bearer` prefix is optional. Returns `None` when the header is
    /// absent, not valid UTF-8, or empty.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let token = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = match token.strip_prefix("Bearer") {
            Some(token) => token.trim(),
            None => token.trim(),
        };
        if token.is_empty() {
            return None;
        }
        Some(Self::new(token))
    }
}

/// Verifies session tokens in optional mode: an invalid token is simply not
/// an identity, never an error.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &RawToken) -> Option<UserId>;
}

/// The address a request came from, as a rate-limit key component.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
pub struct ClientIp(String);

impl ClientIp {
    /// Used when no forwarding header or peer address is available.
    pub const UNKNOWN: &'static str = "unknown";

    /// Resolve the caller address.
    ///
    /// Checks `X-Forwarded-For`, `X-Real-IP` and `Forwarded` before falling
    /// back to the peer address from axum's `ConnectInfo`.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        match SmartIpKeyExtractor.extract(request) {
            Ok(ip) => Self(ip.to_string()),
            Err(error) => {
                debug!(?error, "auth.client_ip.unresolved");
                Self(Self::UNKNOWN.to_string())
            }
        }
    }

    /// The quota identity key for this address.
    pub fn key(&self) -> String {
        format!("ip:{}", self.0)
    }
}

impl From<&str> for ClientIp {
    fn from(ip: &str) -> Self {
        Self(ip.to_string())
    }
}

/// Who a request counts against for quota purposes.
///
/// Derived per request and never persisted.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Identity {
    User(UserId),
    Anonymous(ClientIp),
}

impl Identity {
    /// Resolve the identity of a request, degrading to the caller IP when
    /// there is no valid session token.
    pub fn resolve(headers: &HeaderMap, verifier: &dyn TokenVerifier, ip: &ClientIp) -> Self {
        let Some(token) = RawToken::from_headers(headers) else {
            return Identity::Anonymous(ip.clone());
        };
        match verifier.verify(&token) {
            Some(user) => Identity::User(user),
            None => {
                debug!(%ip, "auth.identity.invalid_token");
                Identity::Anonymous(ip.clone())
            }
        }
    }

    /// The key this identity's quota counters are partitioned by.
    pub fn key(&self) -> String {
        match self {
            Identity::User(user) => format!("user:{user}"),
            Identity::Anonymous(ip) => ip.key(),
        }
    }

    pub fn user(&self) -> Option<&UserId> {
        match self {
            Identity::User(user) => Some(user),
            Identity::Anonymous(_) => None,
        }
    }
}

/// An authenticated session user.
///
/// Extracted from the [`Identity`] the gate attached to the request; anonymous
/// callers are rejected with 401.
#[derive(Clone, Debug)]
pub struct SessionUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for SessionUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Identity>() {
            Some(Identity::User(user)) => Ok(SessionUser(user.clone())),
            _ => Err(AuthRejection::SessionRequired),
        }
    }
}

/// The owner of the API key presented on the execute path.
///
/// Only the gate creates these, after the key was found and active.
#[derive(Clone, Debug)]
pub struct ApiCaller {
    pub owner: UserId,
    pub key_name: String,
}

impl<S: Send + Sync> FromRequestParts<S> for ApiCaller {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ApiCaller>()
            .cloned()
            .ok_or(AuthRejection::ApiKeyRequired)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AuthRejection {
    SessionRequired,
    ApiKeyRequired,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let message = match self {
            AuthRejection::SessionRequired => "Authentication required",
            AuthRejection::ApiKeyRequired => "API key is required",
        };
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
    }
}
