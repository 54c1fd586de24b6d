use thiserror::Error;

/// A record rejected at the store boundary. The record is skipped, siblings continue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("empty required field: {0}")]
    EmptyField(&'static str),

    #[error("sell price value is not finite")]
    NonFinitePrice,

    #[error("sell price value must be positive, got {0}")]
    NonPositivePrice(f64),

    #[error("sell price {text:?} does not match value {value}")]
    PriceMismatch { text: String, value: f64 },

    #[error("title {0:?} has no comparison key")]
    EmptyKey(String),
}

/// Failure of the persistence layer itself.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum UpsertError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a pipeline task produced nothing. Logged per task, never propagated.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("collaborator timed out after {0}s")]
    Timeout(u64),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("feed unreadable: {0}")]
    Feed(String),

    #[error("invalid task: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
