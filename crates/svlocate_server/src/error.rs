use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use svcorpus::places::PlacesError;
use svcorpus::preprocess::PreprocessError;
use svcorpus::{CaptureError, LocateError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

/// Any failure answered as `{"success": false, "error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn internal(message: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        } else {
            tracing::warn!(status = %self.status, error = %self.message, "Request rejected");
        }
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::InvalidTheta(_) | CaptureError::Grid(_) => Self::bad_request(err),
            CaptureError::Busy => Self {
                status: StatusCode::CONFLICT,
                message: err.to_string(),
            },
            CaptureError::QueriesInFlight => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: err.to_string(),
            },
            other => Self::internal(other),
        }
    }
}

impl From<LocateError> for ApiError {
    fn from(err: LocateError) -> Self {
        match err {
            LocateError::Busy => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: err.to_string(),
            },
            LocateError::UnsupportedUpload(_)
            | LocateError::Preprocess(PreprocessError::Image(_) | PreprocessError::EmptyImage) => {
                Self::bad_request(err)
            }
            other => Self::internal(other),
        }
    }
}

impl From<PlacesError> for ApiError {
    fn from(err: PlacesError) -> Self {
        match err {
            PlacesError::Backend(_) => Self::internal(err),
            _ => Self::bad_request(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcorpus::grid::GridError;

    #[test]
    fn capture_refusals_say_why() {
        let running = ApiError::from(CaptureError::Busy);
        assert_eq!(running.status, StatusCode::CONFLICT);

        let querying = ApiError::from(CaptureError::QueriesInFlight);
        assert_eq!(querying.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!querying.message.contains("in progress"), "{}", querying.message);

        let dense = ApiError::from(CaptureError::Grid(GridError::TooManyPoints {
            requested: 1 << 40,
            limit: 100_000,
        }));
        assert_eq!(dense.status, StatusCode::BAD_REQUEST);
    }
}
