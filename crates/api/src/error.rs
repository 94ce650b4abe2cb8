//! API error types and HTTP response mapping.
//!
//! Every failure leaving a handler renders as a flat JSON envelope:
//! `{"error": "<CODE>", "message": "..."}` plus error-specific extras
//! (shortfall arithmetic for insufficient credits, retry metadata for
//! rate limits). The codes are stable strings callers match on.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use onesub_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("resource not found")]
    NotFound,

    #[error("insufficient credits")]
    InsufficientCredits { current_balance: i64, required: i64 },

    #[error("rate limit exceeded")]
    RateLimited {
        retry_after: u64,
        limit: u32,
        remaining: u32,
    },

    /// Entitlement resolution failed. Callers must treat this as "deny",
    /// never as a grant, so it maps to 503 rather than a 200 with guesses.
    #[error("entitlement lookup failed: {0}")]
    LookupFailed(String),

    #[error("internal server error")]
    Internal,
}

impl ApiError {
    /// Stable machine-readable code used in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::LookupFailed(_) => "LOOKUP_FAILED",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) | ApiError::InsufficientCredits { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::LookupFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        ApiError::Internal
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(message) => ApiError::Validation(message),
            BillingError::LookupFailed(message) => ApiError::LookupFailed(message),
            BillingError::CheckoutNotFound(_) | BillingError::SubscriptionNotFound { .. } => {
                ApiError::NotFound
            }
            BillingError::CheckoutNotPending(id) => {
                ApiError::Validation(format!("checkout {id} is not pending"))
            }
            BillingError::SignatureInvalid(message) => {
                tracing::warn!(error = %message, "signature rejected");
                ApiError::Unauthorized
            }
            BillingError::Database(source) => {
                tracing::error!(error = %source, "database error");
                ApiError::Internal
            }
            BillingError::Encryption(message) | BillingError::Internal(message) => {
                tracing::error!(error = %message, "billing internal error");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Auth failures stay generic in the response; details go to logs.
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::InsufficientCredits {
                current_balance,
                required,
            } => format!("Insufficient credits: have {current_balance}, need {required}"),
            ApiError::RateLimited { .. } => "Rate limit exceeded".to_string(),
            ApiError::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.code(),
            "message": message,
        });
        match &self {
            ApiError::InsufficientCredits {
                current_balance,
                required,
            } => {
                body["current_balance"] = json!(current_balance);
                body["required"] = json!(required);
                body["shortfall"] = json!(required - current_balance);
            }
            ApiError::RateLimited {
                retry_after,
                limit,
                remaining,
            } => {
                body["retry_after"] = json!(retry_after);
                body["limit"] = json!(limit);
                body["remaining"] = json!(remaining);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from(retry_after));
        }
        response
    }
}
