//! `GET /build/{codename}` — the last build reported by a codename.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use karl_core::{ClaireBuildInfo, RuntimeStatus};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Returns the stored [`ClaireBuildInfo`], or 404 for an unknown codename.
pub async fn build_info<R: RuntimeStatus>(
    State(state): State<Arc<AppState<R>>>,
    Path(codename): Path<String>,
) -> ApiResult<Json<ClaireBuildInfo>> {
    let stored = state
        .storage
        .read_only(|tables| tables.builds.get(&codename).cloned())
        .await;
    stored
        .map(Json)
        .ok_or_else(|| ApiError::CodenameNotFound(codename))
}
