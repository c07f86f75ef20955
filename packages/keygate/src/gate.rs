//! The authorization gate: admit or reject a request before its handler runs.
//!
//! For every gated request the gate:
//!
//! 1. resolves the caller [`Identity`] (optional authentication);
//! 2. checks the global quota;
//! 3. checks the route group's quota;
//! 4. on the execute path, requires an active API key and records its owner.
//!
//! Each step either passes or ends the request with a [`Rejection`]; nothing
//! is retried. Quota checks that already passed stay counted when a later
//! step rejects.
//!
//! ## Store failures
//!
//! If the counter store or the key store fails, the request is rejected with
//! 503. The gate never admits a request it could not account for.
//!
//! ## Middleware
//!
//! The gate runs as axum middleware through [`enforce`], layered per route
//! group with `route_layer`:
//!
//! ```ignore
//! Router::new()
//!     .route("/", get(handler))
//!     .route_layer(middleware::from_fn_with_state(gate.scoped(RouteGroup::Apis), gate::enforce))
//! ```

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use color_eyre::eyre::Report;
use derive_more::{Debug, Display};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    auth::{ApiCaller, ClientIp, Identity, TokenVerifier},
    keys::{API_KEY_HEADER, KeyStore},
    policy::{KeyFunction, PolicyTable, QuotaRule, RouteGroup},
    quota::{Decision, QuotaTracker},
};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Why the gate refused a request.
#[derive(Debug, Display)]
pub enum Rejection {
    #[display("quota exceeded for scope {scope}; retry after {retry_after}s")]
    QuotaExceeded {
        scope: String,
        limit: u64,
        retry_after: u64,
    },

    #[display("no api key supplied")]
    MissingApiKey,

    #[display("api key unknown or inactive")]
    InvalidApiKey,

    #[display("backing store unavailable: {_0}")]
    StoreUnavailable(Report),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::QuotaExceeded {
                limit,
                retry_after,
                ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    (RETRY_AFTER, HeaderValue::from(retry_after)),
                    (RATE_LIMIT_LIMIT, HeaderValue::from(limit)),
                    (RATE_LIMIT_REMAINING, HeaderValue::from(0u64)),
                    (RATE_LIMIT_RESET, HeaderValue::from(retry_after)),
                ],
                Json(json!({
                    "error": "Too many requests",
                    "message": "Rate limit exceeded. Please try again later.",
                })),
            )
                .into_response(),
            Rejection::MissingApiKey => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "API key is required" })),
            )
                .into_response(),
            Rejection::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid or inactive API key" })),
            )
                .into_response(),
            Rejection::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Service unavailable" })),
            )
                .into_response(),
        }
    }
}

/// Quota state for one scope after an admitted check.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct QuotaStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: u64,
}

/// The result of a request passing the gate.
#[derive(Clone, Debug)]
pub struct Admission {
    pub identity: Identity,

    /// Set on the execute path only.
    pub caller: Option<ApiCaller>,

    /// One entry per scope checked, global first.
    pub quota: Vec<QuotaStatus>,
}

impl Admission {
    /// Rate-limit headers describing the tightest scope checked.
    pub fn rate_limit_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(status) = self.quota.iter().min_by_key(|status| status.remaining) {
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(status.limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(status.remaining));
            headers.insert(RATE_LIMIT_RESET, HeaderValue::from(status.reset_after));
        }
        headers
    }
}

/// Decides admit or reject for inbound requests.
#[derive(Clone, Debug)]
#[debug("Gate({:?})", self.inner.policy)]
pub struct Gate {
    inner: Arc<GateInner>,
}

struct GateInner {
    policy: PolicyTable,
    quota: QuotaTracker,
    keys: Arc<dyn KeyStore>,
    verifier: Arc<dyn TokenVerifier>,
}

impl Gate {
    pub fn new(
        policy: PolicyTable,
        quota: QuotaTracker,
        keys: impl KeyStore,
        verifier: impl TokenVerifier,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                policy,
                quota,
                keys: Arc::new(keys),
                verifier: Arc::new(verifier),
            }),
        }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.inner.policy
    }

    /// Middleware state enforcing the global rule and `group`'s rule.
    pub fn scoped(&self, group: RouteGroup) -> ScopedGate {
        ScopedGate {
            gate: self.clone(),
            group: Some(group),
        }
    }

    /// Middleware state enforcing only the global rule.
    pub fn global(&self) -> ScopedGate {
        ScopedGate {
            gate: self.clone(),
            group: None,
        }
    }

    /// Run the gate for a request in `group`, or for the global rule alone
    /// when `group` is `None`.
    #[tracing::instrument(name = "Gate::authorize", skip(self, request), fields(method = %request.method(), path = %request.uri().path()))]
    pub async fn authorize<B>(
        &self,
        request: &http::Request<B>,
        group: Option<RouteGroup>,
    ) -> Result<Admission, Rejection> {
        let ip = ClientIp::from_request(request);
        let identity = Identity::resolve(request.headers(), self.inner.verifier.as_ref(), &ip);
        debug!(identity = %identity.key(), "gate.identity");

        let mut quota = Vec::with_capacity(2);
        quota.push(self.check(self.inner.policy.global(), &ip, &identity).await?);
        if let Some(group) = group {
            quota.push(self.check(self.inner.policy.lookup(group), &ip, &identity).await?);
        }

        let caller = match group {
            Some(RouteGroup::Execute) => Some(self.api_caller(request.headers()).await?),
            _ => None,
        };

        Ok(Admission {
            identity,
            caller,
            quota,
        })
    }

    async fn check(
        &self,
        rule: &QuotaRule,
        ip: &ClientIp,
        identity: &Identity,
    ) -> Result<QuotaStatus, Rejection> {
        let key = match rule.key {
            KeyFunction::Ip => ip.key(),
            KeyFunction::Identity => identity.key(),
        };

        match self.inner.quota.check_and_increment(&rule.scope, &key, rule).await {
            Ok(Decision::Admit {
                remaining,
                reset_after,
            }) => Ok(QuotaStatus {
                limit: rule.ceiling,
                remaining,
                reset_after,
            }),
            Ok(Decision::Reject { retry_after }) => {
                warn!(scope = %rule.scope, %key, retry_after, "gate.quota.rejected");
                Err(Rejection::QuotaExceeded {
                    scope: rule.scope.clone(),
                    limit: rule.ceiling,
                    retry_after,
                })
            }
            Err(err) => {
                error!(?err, scope = %rule.scope, "gate.quota.store_error");
                Err(Rejection::StoreUnavailable(err))
            }
        }
    }

    async fn api_caller(&self, headers: &HeaderMap) -> Result<ApiCaller, Rejection> {
        let Some(header) = headers.get(API_KEY_HEADER) else {
            warn!("gate.api_key.missing");
            return Err(Rejection::MissingApiKey);
        };
        let Ok(key) = header.to_str().map(str::trim) else {
            warn!("gate.api_key.not_ascii");
            return Err(Rejection::InvalidApiKey);
        };
        if key.is_empty() {
            warn!("gate.api_key.missing");
            return Err(Rejection::MissingApiKey);
        }

        match self.inner.keys.find_active_key(key).await {
            Ok(Some(record)) if record.is_active => {
                debug!(owner = %record.owner, name = %record.name, "gate.api_key.accepted");
                Ok(ApiCaller {
                    owner: record.owner,
                    key_name: record.name,
                })
            }
            Ok(Some(record)) => {
                warn!(owner = %record.owner, "gate.api_key.inactive");
                Err(Rejection::InvalidApiKey)
            }
            Ok(None) => {
                warn!("gate.api_key.unknown");
                Err(Rejection::InvalidApiKey)
            }
            Err(err) => {
                error!(?err, "gate.api_key.store_error");
                Err(Rejection::StoreUnavailable(err))
            }
        }
    }
}

/// A gate bound to the routes of one group; the state for [`enforce`].
#[derive(Clone, Debug)]
pub struct ScopedGate {
    gate: Gate,
    group: Option<RouteGroup>,
}

/// Middleware running the gate before the wrapped handler.
///
/// Admitted requests get their [`Identity`] (and [`ApiCaller`] on the
/// execute path) inserted as request extensions, and their responses get
/// `X-RateLimit-*` headers.
pub async fn enforce(State(scoped): State<ScopedGate>, request: Request, next: Next) -> Response {
    // The body isn't `Sync`, so the gate only sees the request head.
    let (parts, body) = request.into_parts();
    let head = http::Request::from_parts(parts, ());
    let result = scoped.gate.authorize(&head, scoped.group).await;
    let (parts, ()) = head.into_parts();
    let mut request = http::Request::from_parts(parts, body);

    let admission = match result {
        Ok(admission) => admission,
        Err(rejection) => return rejection.into_response(),
    };

    let headers = admission.rate_limit_headers();
    request.extensions_mut().insert(admission.identity);
    if let Some(caller) = admission.caller {
        request.extensions_mut().insert(caller);
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    response
}
