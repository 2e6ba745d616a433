//! Error types shared across Larder crates

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid subscription tier: {0}")]
    InvalidTier(String),

    #[error("Invalid subscription status: {0}")]
    InvalidStatus(String),

    #[error("Invalid provider: {0}")]
    InvalidProvider(String),
}
