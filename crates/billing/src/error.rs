//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    #[error("Unknown checkout session: {0}")]
    UnknownSession(String),

    #[error("Price not found in catalog: {0}")]
    PriceNotFound(String),

    #[error("No active subscription for {0}")]
    NoActiveSubscription(String),

    #[error("Payment processor returned {status}: {message}")]
    Processor { status: u16, message: String },

    #[error("Payment processor request failed: {0}")]
    ProcessorTransport(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Billing configuration error: {0}")]
    Config(String),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors raised by the processor round trip rather than by local state.
    pub fn is_processor_error(&self) -> bool {
        matches!(
            self,
            BillingError::Processor { .. } | BillingError::ProcessorTransport(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BillingError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BillingError::Database(format!("migration failed: {}", err))
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BillingError::ProcessorTransport(format!("request timed out: {}", err))
        } else {
            BillingError::ProcessorTransport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::MalformedEvent(err.to_string())
    }
}
