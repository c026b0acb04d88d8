//! Token economy error types

use thiserror::Error;

/// Errors from the profile store, ledger, and access resolver.
///
/// Most of these are "happy failures": the resolver recovers from all of them
/// (profile creation, free-fallback degradation, silent repair) and never lets
/// them cross the UI boundary.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Store read failed: {0}")]
    StoreRead(String),

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Realtime feed error: {0}")]
    Feed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for TokenError {
    fn from(err: sqlx::Error) -> Self {
        TokenError::Database(err.to_string())
    }
}

pub type TokenResult<T> = Result<T, TokenError>;
