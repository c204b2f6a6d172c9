use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::{Error, RedemptionError};

/// HTTP 错误响应
///
/// 响应体：`{ "error": <Kind>, "message": ..., "remainingAttempts"?: n }`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<RedemptionError> for ApiError {
    fn from(err: RedemptionError) -> Self {
        ApiError(err.into())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_attempts: Option<u32>,
}

fn redemption_status(err: &RedemptionError) -> StatusCode {
    match err {
        RedemptionError::InvalidToken => StatusCode::NOT_FOUND,
        RedemptionError::LinkExpired | RedemptionError::AlreadyUsed => StatusCode::GONE,
        RedemptionError::OtpExpired => StatusCode::BAD_REQUEST,
        RedemptionError::InvalidOtp { .. } | RedemptionError::VerificationRequired => {
            StatusCode::UNAUTHORIZED
        }
        RedemptionError::TooManyAttempts => StatusCode::LOCKED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            Error::Redemption(err) => {
                let remaining_attempts = match err {
                    RedemptionError::InvalidOtp { remaining_attempts } => Some(*remaining_attempts),
                    _ => None,
                };
                (
                    redemption_status(err),
                    ErrorBody {
                        error: err.kind(),
                        message: err.to_string(),
                        remaining_attempts,
                    },
                )
            }
            Error::Validation(err) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "ValidationError",
                    message: err.to_string(),
                    remaining_attempts: None,
                },
            ),
            Error::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    error: "RateLimited",
                    message: "too many requests, please retry later".to_string(),
                    remaining_attempts: None,
                },
            ),
            Error::Storage(err) => {
                tracing::error!(error = %err, "storage failure while handling request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorBody {
                        error: "StorageUnavailable",
                        message: "service temporarily unavailable".to_string(),
                        remaining_attempts: None,
                    },
                )
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "InternalError",
                        message: "internal server error".to_string(),
                        remaining_attempts: None,
                    },
                )
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let Error::RateLimitExceeded { retry_after } = &self.0 {
            // 向上取整到秒，至少 1 秒
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
