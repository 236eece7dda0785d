//! Crate-wide error taxonomy and the OpenAI-shaped wire error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing credentials: {0}")]
    AuthMissing(String),
    #[error("invalid credentials: {0}")]
    AuthInvalid(String),
    #[error("daily budget exceeded: spent {spent_cents} of {limit_cents} cents")]
    BudgetExceeded { spent_cents: i64, limit_cents: i64 },
    #[error("rate limit exceeded: {limit} requests per minute")]
    RateLimited { limit: u32, retry_after_secs: u64 },
    #[error("{message}")]
    ContentBlocked { filter: String, message: String },
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("no eligible provider: {0}")]
    NoEligibleRoute(String),
    #[error("provider dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthMissing(_) | Self::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            // 451 Unavailable For Legal Reasons, reused for content blocks.
            Self::ContentBlocked { .. } => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoEligibleRoute(_) | Self::DispatchFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) | Self::Http(_) | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::AuthMissing(_) | Self::AuthInvalid(_) => "authentication_error",
            Self::BudgetExceeded { .. } => "budget_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::ContentBlocked { .. } => "content_filter_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::NoEligibleRoute(_)
            | Self::DispatchFailed(_)
            | Self::Internal(_)
            | Self::Http(_)
            | Self::Json(_) => "server_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing(_) | Self::AuthInvalid(_) => "invalid_api_key",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::ContentBlocked { .. } => "content_blocked",
            Self::BadRequest(_) => "invalid_request",
            Self::NoEligibleRoute(_) | Self::DispatchFailed(_) => "service_unavailable",
            Self::Internal(_) | Self::Http(_) | Self::Json(_) => "internal_error",
        }
    }

    /// Render the unified error body, echoing the gateway request id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        let body = ApiError {
            error: ApiErrorBody {
                message: self.to_string(),
                error_type: self.error_type().to_string(),
                code: self.code().to_string(),
                aegis_request_id: request_id.to_string(),
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

/// OpenAI-compatible error envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    #[serde(default)]
    pub aegis_request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping_matches_taxonomy() {
        let cases: Vec<(GatewayError, u16, &str, &str)> = vec![
            (
                GatewayError::BadRequest("x".into()),
                400,
                "invalid_request_error",
                "invalid_request",
            ),
            (
                GatewayError::AuthInvalid("x".into()),
                401,
                "authentication_error",
                "invalid_api_key",
            ),
            (
                GatewayError::BudgetExceeded {
                    spent_cents: 10,
                    limit_cents: 5,
                },
                402,
                "budget_error",
                "budget_exceeded",
            ),
            (
                GatewayError::RateLimited {
                    limit: 60,
                    retry_after_secs: 30,
                },
                429,
                "rate_limit_error",
                "rate_limit_exceeded",
            ),
            (
                GatewayError::ContentBlocked {
                    filter: "secrets".into(),
                    message: "blocked".into(),
                },
                451,
                "content_filter_error",
                "content_blocked",
            ),
            (
                GatewayError::NoEligibleRoute("m".into()),
                503,
                "server_error",
                "service_unavailable",
            ),
            (
                GatewayError::Internal("boom".into()),
                500,
                "server_error",
                "internal_error",
            ),
        ];

        for (err, status, error_type, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
            assert_eq!(err.error_type(), error_type, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn error_body_serializes_openai_shape() {
        let err = GatewayError::ContentBlocked {
            filter: "secrets".into(),
            message: "Request blocked".into(),
        };
        let body = ApiError {
            error: ApiErrorBody {
                message: err.to_string(),
                error_type: err.error_type().into(),
                code: err.code().into(),
                aegis_request_id: "req-1".into(),
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "content_filter_error");
        assert_eq!(json["error"]["code"], "content_blocked");
        assert_eq!(json["error"]["aegis_request_id"], "req-1");
    }
}
