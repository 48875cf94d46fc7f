//! HTTP route handlers.

pub mod build;
pub mod favicon;
pub mod ingest;
pub mod snapshot;
pub mod status;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use karl_core::RuntimeStatus;

use crate::state::AppState;

/// Karl's route table, mounted at the configured base URL.
pub fn routes<R: RuntimeStatus>() -> Router<Arc<AppState<R>>> {
    Router::new()
        .route(
            "/",
            get(status::fleet_status::<R>)
                .post(ingest::keepalive::<R>)
                .delete(ingest::deregister::<R>),
        )
        .route("/build/{codename}", get(build::build_info::<R>))
        .route("/snapshot/{codename}", get(snapshot::snapshot::<R>))
        .route("/favicon.png", get(favicon::favicon))
}
