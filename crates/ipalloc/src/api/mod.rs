//! REST API
//!
//! A thin HTTP adapter over [`AllocationService`](crate::allocator::AllocationService).
//!
//! # Endpoints
//!
//! - `POST /api/allocation/:key` - Allocate subnets, body
//!   `{"prefix_lengths": [24, 26], "environment": "dev"}`
//! - `GET /api/allocation/:key` - List subnets held under a key
//! - `DELETE /api/allocation/:key` - Release every subnet held under a key
//! - `GET /api/health` - Health check
//!
//! Successful responses are `{"data": ...}`; failures are
//! `{"type": "...", "message": "..."}`. Allocation routes require the
//! `Runner` role.

pub mod authz;
pub mod dto;
pub mod handlers;
pub mod router;
pub mod state;

pub use authz::{authorize, AccessTable, CallerIdentity, RouteRules, RUNNER_ROLE};
pub use dto::*;
pub use router::create_router;
pub use state::AppState;

use std::future::Future;
use std::sync::Arc;

/// Serve the API until `shutdown` resolves
pub async fn start_server<F>(
    state: Arc<AppState>,
    bind_addr: &str,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("Starting API server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
