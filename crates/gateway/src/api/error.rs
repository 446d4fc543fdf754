//! Error-to-HTTP mapping.
//!
//! The only place where domain errors become status codes. Every error
//! body has the same shape: `{message, error_code, details}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use hub_domain::error::{Error, ErrorCode};

pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Authentication => StatusCode::UNAUTHORIZED,
        ErrorCode::Authorization => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Duplicate => StatusCode::CONFLICT,
        ErrorCode::BusinessLogic => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ExternalService => StatusCode::BAD_GATEWAY,
        ErrorCode::Database | ErrorCode::Configuration | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = status_for(code);
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = code.as_str(), "request failed");
        } else {
            tracing::debug!(error = %self.0, code = code.as_str(), "request rejected");
        }
        let body = serde_json::json!({
            "message": self.0.to_string(),
            "error_code": code,
            "details": self.0.details(),
        });
        (status, Json(body)).into_response()
    }
}
