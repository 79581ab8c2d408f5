use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::EmsError;

/// HTTP-facing wrapper mapping `EmsError` kinds onto status codes.
#[derive(Debug)]
pub struct ApiError(pub EmsError);

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            EmsError::OutOfRange { .. }
            | EmsError::WrongMode { .. }
            | EmsError::DeviceFault(_)
            | EmsError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            EmsError::NotFound(_) => StatusCode::NOT_FOUND,
            EmsError::NotConnected | EmsError::Timeout | EmsError::StaleFrequency => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EmsError::Protocol { .. } | EmsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match &self.0 {
            EmsError::NotConnected => "NotConnected",
            EmsError::Timeout => "Timeout",
            EmsError::Protocol { .. } => "Protocol",
            EmsError::OutOfRange { .. } => "OutOfRange",
            EmsError::WrongMode { .. } => "WrongMode",
            EmsError::DeviceFault(_) => "DeviceFault",
            EmsError::NotFound(_) => "NotFound",
            EmsError::StaleFrequency => "StaleFrequency",
            EmsError::ConfigInvalid(_) => "ConfigInvalid",
            EmsError::Io(_) => "Io",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self.0 {
            EmsError::Protocol { .. } | EmsError::Io(_) => {
                tracing::error!(error = %self.0, "device error behind API call");
                "Device communication failed".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: self.error_type().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<EmsError> for ApiError {
    fn from(e: EmsError) -> Self {
        Self(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Mode;

    #[test]
    fn status_codes_follow_the_error_kind() {
        assert_eq!(
            ApiError(EmsError::NotFound(3)).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(EmsError::out_of_range("power", 2000.0, -1500.0, 1500.0)).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(EmsError::WrongMode { mode: Mode::Auto }).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(EmsError::NotConnected).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(EmsError::Protocol { code: 2 }).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
