//! Database error types.

use stitcher_common::StitchError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    #[error("Graph store lock poisoned")]
    Poisoned,

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl From<DbError> for StitchError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Io(e) => StitchError::Io(e),
            DbError::NotFound(id) => StitchError::EntityNotFound(id),
            other => StitchError::Database(other.to_string()),
        }
    }
}
