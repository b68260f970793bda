//! Error types for the storage layer

use meshlink_core::LinkError;
use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Error, Debug)]
pub enum StateError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Record not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Stored value could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Duplicate entry
    #[error("Duplicate {entity}: {id}")]
    Duplicate { entity: String, id: String },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StateError::NotFound {
                entity: "record".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => {
                if db_err.message().contains("UNIQUE constraint") {
                    StateError::Duplicate {
                        entity: "record".to_string(),
                        id: "unknown".to_string(),
                    }
                } else {
                    StateError::Database(db_err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StateError::Connection(err.to_string())
            }
            _ => StateError::Database(err.to_string()),
        }
    }
}

impl From<chrono::ParseError> for StateError {
    fn from(err: chrono::ParseError) -> Self {
        StateError::Deserialization(err.to_string())
    }
}

impl From<StateError> for LinkError {
    fn from(err: StateError) -> Self {
        LinkError::Storage(err.to_string())
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StateError>;
