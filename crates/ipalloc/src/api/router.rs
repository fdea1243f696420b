//! API router configuration

use super::authz;
use super::handlers;
use super::state::AppState;
use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Allocation routes for one caller key
pub const ALLOCATION_ROUTE: &str = "/api/allocation/:key";

/// Liveness route
pub const HEALTH_ROUTE: &str = "/api/health";

/// Create the API router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            ALLOCATION_ROUTE,
            get(handlers::list_allocations)
                .post(handlers::allocate)
                .delete(handlers::release_allocations),
        )
        .route(HEALTH_ROUTE, get(handlers::health))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            authz::authorize_request,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
