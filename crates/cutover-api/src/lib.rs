//! cutover-api — REST API for the upgrade orchestrator.
//!
//! Provides axum route handlers for starting, inspecting, and rolling
//! back upgrade sessions, plus a live SSE event stream per session.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/upgrades` | Start an upgrade session |
//! | GET | `/api/v1/upgrades` | List all sessions |
//! | GET | `/api/v1/upgrades/history` | Paginated per-agent history |
//! | GET | `/api/v1/upgrades/:id` | Get session snapshot |
//! | POST | `/api/v1/upgrades/:id/rollback` | Trigger a manual rollback |
//! | GET | `/api/v1/upgrades/:id/stream` | SSE stream of session events |
//! | GET | `/api/v1/versions` | List published agent versions |
//! | POST | `/api/v1/versions` | Publish an agent version |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use cutover_session::SessionManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
}

/// Build the complete API router.
pub fn build_router(manager: Arc<SessionManager>) -> Router {
    let state = ApiState { manager };

    let api_routes = Router::new()
        .route(
            "/upgrades",
            post(handlers::start_upgrade).get(handlers::list_upgrades),
        )
        .route("/upgrades/history", get(handlers::upgrade_history))
        .route("/upgrades/{id}", get(handlers::get_upgrade))
        .route("/upgrades/{id}/rollback", post(handlers::rollback_upgrade))
        .route("/upgrades/{id}/stream", get(handlers::stream_upgrade))
        .route(
            "/versions",
            get(handlers::list_versions).post(handlers::publish_version),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
