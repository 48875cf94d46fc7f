//! `GET /snapshot/{codename}` — the latest keepalive recorded for a codename.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use karl_core::RuntimeStatus;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Query-string parameters of the snapshot endpoint.
#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    /// Strip the build section from the response.
    pub nobuild: Option<String>,
}

/// Returns the latest keepalive, rebased so `age_us` is negative by its age.
///
/// The in-memory index cache answers directly when warm; a cold codename costs
/// one full scan of the log, memoized for the next call.
pub async fn snapshot<R: RuntimeStatus>(
    State(state): State<Arc<AppState<R>>>,
    Path(codename): Path<String>,
    Query(params): Query<SnapshotParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut index_plus_one = {
        let cache = state.latest_index_cache();
        cache.get(&codename).copied().unwrap_or(0)
    };

    if index_plus_one == 0 {
        for persisted in state.stream.iter_all() {
            if persisted.entry.keepalive.status.codename == codename {
                index_plus_one = persisted.idx_ts.index + 1;
            }
        }
        if index_plus_one != 0 {
            let mut cache = state.latest_index_cache();
            let slot = cache.entry(codename.clone()).or_insert(0);
            *slot = (*slot).max(index_plus_one);
        }
    }

    if index_plus_one == 0 {
        return Err(ApiError::NoKeepalives(codename));
    }

    let persisted = state
        .stream
        .iter_range(index_plus_one - 1, index_plus_one)
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NoKeepalives(codename.clone()))?;

    let age_us = persisted.idx_ts.us - state.clock.now();
    // Serve the preserved raw body when the runtime variant was unknown at
    // ingest, so the round trip stays lossless.
    let mut keepalive = match persisted.entry.raw_status {
        Some(raw) => raw,
        None => serde_json::to_value(&persisted.entry.keepalive)
            .map_err(|_| ApiError::Registration)?,
    };
    if params.nobuild.is_some() {
        if let Some(object) = keepalive.as_object_mut() {
            object.remove("build");
        }
    }

    Ok(Json(json!({
        "age_us": age_us.as_micros(),
        "keepalive": keepalive,
    })))
}
