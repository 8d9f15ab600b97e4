//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use brandsite_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad gateway: {0}")]
    BadGateway(String),
    #[error("Billing is not configured")]
    ServiceUnavailable,
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "processor_error"),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "billing_unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Billing(e) => match e {
                BillingError::InvalidSignature => (StatusCode::BAD_REQUEST, "invalid_signature"),
                BillingError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, "malformed_event"),
                BillingError::UnknownSession(_) => (StatusCode::NOT_FOUND, "unknown_session"),
                BillingError::PriceNotFound(_) => (StatusCode::NOT_FOUND, "price_not_found"),
                BillingError::NoActiveSubscription(_) => {
                    (StatusCode::NOT_FOUND, "no_active_subscription")
                }
                BillingError::Processor { .. } | BillingError::ProcessorTransport(_) => {
                    (StatusCode::BAD_GATEWAY, "processor_error")
                }
                BillingError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
                BillingError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
                BillingError::Config(_) => (StatusCode::SERVICE_UNAVAILABLE, "billing_unavailable"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();

        // Storage details stay in the logs.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            if status == StatusCode::BAD_GATEWAY {
                tracing::warn!(error = %self, "Payment processor call failed");
            }
            self.to_string()
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
