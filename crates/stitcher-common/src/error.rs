use thiserror::Error;

use crate::keys::KeyType;

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid {key} value: {value:?}")]
    InvalidKey { key: KeyType, value: String },

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Refusing to stitch entity {0} to itself")]
    SelfLoop(String),

    #[error("Refusing {kind} coreference between entities {from} and {to} of the same data source {source_key}")]
    SameSourceCoreference {
        kind: String,
        from: String,
        to: String,
        source_key: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StitchError {
    /// Policy rejections are expected outcomes of a stitch request, not failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StitchError::SelfLoop(_) | StitchError::SameSourceCoreference { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StitchError>;
