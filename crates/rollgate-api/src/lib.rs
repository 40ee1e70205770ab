//! rollgate-api — HTTP surface for rollgate.
//!
//! Serves the Omaha update endpoint and a small JSON API for managing the
//! catalog and reading rollout state.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/update` | Omaha update check (XML) |
//! | GET | `/health` | Liveness probe |
//! | POST | `/api/v1/apps` | Create or replace an application |
//! | POST | `/api/v1/groups` | Create or replace a group |
//! | GET | `/api/v1/groups/{id}` | Get a group |
//! | GET | `/api/v1/groups/{id}/stats` | Rollout statistics for the group's current package |
//! | POST | `/api/v1/channels` | Create or replace a channel |
//! | POST | `/api/v1/packages` | Create or replace a package |
//! | GET | `/api/v1/activity` | Recent activity entries, newest first |
//! | GET | `/api/v1/instances/{id}` | Get an instance |
//! | GET | `/api/v1/instances/{id}/apps/{app_id}/history` | Status history and events |

pub mod handlers;
pub mod omaha;

use axum::Router;
use axum::routing::{get, post};
use rollgate_omaha::Handler;
use rollgate_rollout::Controller;
use rollgate_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub controller: Controller,
    pub omaha: Handler,
}

impl ApiState {
    pub fn new(omaha: Handler) -> Self {
        let controller = omaha.controller().clone();
        Self {
            store: controller.store().clone(),
            controller,
            omaha,
        }
    }
}

/// Build the complete router (Omaha + management API + health).
pub fn build_router(omaha: Handler) -> Router {
    let state = ApiState::new(omaha);

    let api_routes = Router::new()
        .route("/apps", post(handlers::put_application))
        .route("/groups", post(handlers::put_group))
        .route("/groups/{id}", get(handlers::get_group))
        .route("/groups/{id}/stats", get(handlers::get_group_stats))
        .route("/channels", post(handlers::put_channel))
        .route("/packages", post(handlers::put_package))
        .route("/activity", get(handlers::list_activity))
        .route("/instances/{id}", get(handlers::get_instance))
        .route(
            "/instances/{id}/apps/{app_id}/history",
            get(handlers::get_instance_history),
        )
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/v1/update", post(omaha::update))
        .route("/v1/update/", post(omaha::update))
        .route("/health", get(handlers::health))
        .with_state(state)
}
