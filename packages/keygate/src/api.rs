//! HTTP surface of the service.
//!
//! ## Dependency injection
//!
//! We use [`aerosol`][^1] to inject dependencies into handlers. Reference
//! [`State`] for the list of dependencies; when building it with [`state`],
//! items are provided in reverse order of the list.
//!
//! Items in the list can be extracted in handlers with the
//! [`Dep`](aerosol::axum::Dep) extractor.
//!
//! [^1]: https://docs.rs/aerosol
//!
//! ## Gating
//!
//! The [`Gate`] is not part of the injected state: it runs as middleware in
//! front of the handlers. Each route group is nested with its own
//! `route_layer`, so a request is checked against exactly one group rule on
//! top of the global rule. The root routes only pass the global rule, and
//! unmatched paths are not gated at all.
//!
//! ## Response types
//!
//! Handlers return per-endpoint enums implementing
//! [`IntoResponse`](axum::response::IntoResponse) rather than a generic
//! response, so every status an endpoint can produce is visible in its type.

use std::time::Duration;

use aerosol::Aero;
use axum::{
    Json, Router, http::StatusCode, middleware::from_fn_with_state, response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::{
    gate::{self, Gate},
    policy::RouteGroup,
    store::Store,
    upstream::Upstream,
};

pub mod apis;
pub mod auth;
pub mod execute;
pub mod keys;
pub mod logs;

const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Headroom over the upstream timeout for the whole request.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

pub type State = Aero![Store, Upstream];

/// Assemble the injected state.
pub fn state(store: Store, upstream: Upstream) -> State {
    Aero::new().with(upstream).with(store)
}

/// Build the router.
///
/// `upstream_timeout` bounds outbound calls; the request timeout layer is
/// set slightly above it so execute calls fail with the upstream error
/// rather than a bare timeout.
pub fn router(state: State, gate: &Gate, upstream_timeout: Duration) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            upstream_timeout + REQUEST_TIMEOUT_MARGIN,
        ));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route_layer(from_fn_with_state(gate.global(), gate::enforce))
        .nest("/api/auth", gated(auth::router(), gate, RouteGroup::Auth))
        .nest("/api/apis", gated(apis::router(), gate, RouteGroup::Apis))
        .nest("/api/keys", gated(keys::router(), gate, RouteGroup::ApiKeys))
        .nest("/api/logs", gated(logs::router(), gate, RouteGroup::Logs))
        .nest("/api/execute", gated(execute::router(), gate, RouteGroup::Execute))
        .fallback(not_found)
        .layer(middleware)
        .with_state(state)
}

fn gated(router: Router<State>, gate: &Gate, group: RouteGroup) -> Router<State> {
    router.route_layer(from_fn_with_state(gate.scoped(group), gate::enforce))
}

async fn index() -> Json<Value> {
    Json(json!({
        "message": "API Management System",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "auth": "/api/auth",
            "apis": "/api/apis",
            "api_keys": "/api/keys",
            "logs": "/api/logs",
            "execute": "/api/execute",
        },
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Resource not found" })),
    )
}
