//! API error types and HTTP response mapping.
//!
//! The wire contract is inherited from the original service: terse plain-text
//! bodies for ingest failures, a JSON `{"error": …}` payload for lookups.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error payload used by the lookup endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The reverse keepalive callback could not be completed.
    #[error("callback error")]
    Callback,

    /// The reported status JSON was unparseable.
    #[error("JSON parse error")]
    JsonParse,

    /// Query-string parameters contradicted the reported body.
    #[error("inconsistent URL/body parameters")]
    InconsistentParameters,

    /// No build information is stored for the codename.
    #[error("codename '{0}' not found")]
    CodenameNotFound(String),

    /// No keepalives have ever been received from the codename.
    #[error("no keepalives from '{0}'")]
    NoKeepalives(String),

    /// A topology view could not be rendered.
    #[error("render error")]
    Render,

    /// An unexpected failure during ingest commit.
    #[error("registration error")]
    Registration,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Callback => (StatusCode::BAD_REQUEST, "Callback error.\n").into_response(),
            Self::JsonParse => (StatusCode::BAD_REQUEST, "JSON parse error.\n").into_response(),
            Self::InconsistentParameters => {
                (StatusCode::BAD_REQUEST, "Inconsistent URL/body parameters.\n").into_response()
            }
            Self::CodenameNotFound(codename) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("Codename '{codename}' not found."),
                }),
            )
                .into_response(),
            Self::NoKeepalives(codename) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!("No keepalives from '{codename}' have been received."),
                }),
            )
                .into_response(),
            Self::Render => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Render error.\n").into_response()
            }
            Self::Registration => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Karl registration error.\n",
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_failures_map_to_bad_request() {
        for error in [
            ApiError::Callback,
            ApiError::JsonParse,
            ApiError::InconsistentParameters,
        ] {
            let response = error.into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn lookup_failures_map_to_not_found() {
        let response = ApiError::CodenameNotFound("X".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn registration_failure_maps_to_internal() {
        let response = ApiError::Registration.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
