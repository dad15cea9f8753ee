//! HTTP surface. Every route acts on the configured default user.

pub mod routes;
pub mod types;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

pub use types::ApiError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/api/sensors/aggregate",
            post(routes::aggregates::trigger_aggregation),
        )
        .route(
            "/api/sensors/aggregates",
            get(routes::aggregates::list_aggregates),
        )
        .route(
            "/api/sensors/aggregates/{period}/{key}",
            get(routes::aggregates::get_aggregate),
        )
        .route("/api/sensors/withings/sync", post(routes::withings::sync))
        .route(
            "/api/sensors/withings/full-sync",
            post(routes::withings::full_sync),
        )
        .route("/api/sensors/withings/status", get(routes::withings::status))
        .route(
            "/api/sensors/withings/disconnect",
            post(routes::withings::disconnect),
        )
        .route("/api/sensors/withings/connect", get(routes::withings::connect))
        .route(
            "/api/sensors/withings/callback",
            get(routes::withings::callback),
        )
        .with_state(state)
}
