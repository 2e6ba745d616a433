//! Billing error types

use thiserror::Error;

/// Entitlement engine errors
///
/// Storage and processor failures collapse into [`BillingError::UpstreamFailure`];
/// callers only ever see the generic variant, the detail goes to the logs.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// True for failures of storage or the payment processor
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamFailure(_))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::UpstreamFailure(format!("stripe: {}", err))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::UpstreamFailure(format!("database: {}", err))
    }
}

impl From<larder_shared::SharedError> for BillingError {
    fn from(err: larder_shared::SharedError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
