//! stitcher-common: Shared types, errors, and configuration used across all stitcher crates.

pub mod error;
pub mod value;
pub mod keys;
pub mod relation;
pub mod source_config;
pub mod telemetry;

// Re-export commonly used types
pub use error::{Result, StitchError};
pub use keys::{KeyPair, KeyType};
pub use relation::RelationKind;
pub use value::{merge, merge_payload, Payload, RawRecord, Scalar, Value};
pub use source_config::{SourceConfig, SourceSpec, StitchSpec, ReferenceSpec, RuleSpec, RuleActionSpec};
