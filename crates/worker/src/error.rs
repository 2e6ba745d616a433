//! Worker error types

use larder_billing::BillingError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Owner profile write failed for {0}")]
    OwnerWriteFailed(Uuid),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
