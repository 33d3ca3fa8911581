//! Stitcher Graph Store
//!
//! This crate defines the transactional property-graph interface the
//! stitching core writes through, the persisted node/edge/provenance
//! schema, and an embedded in-memory implementation with JSON snapshot
//! persistence.
//!
//! # Example
//!
//! ```rust,no_run
//! use stitcher_db::{GraphStore, InMemoryGraph, IndexKey};
//! use stitcher_common::{KeyType, Payload};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = InMemoryGraph::open("./data/stitcher.json")?;
//!
//!     let mut tx = graph.begin()?;
//!     let id = tx.create_entity(Payload::new(), ["S_HPO".to_string()].into(), Some("a1b2c3d4e"))?;
//!     tx.index(id, &IndexKey::Key(KeyType::Uri), "http://purl.obolibrary.org/obo/HP_0000118")?;
//!     tx.commit()?;
//!
//!     graph.flush()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod schema;
pub mod store;
pub mod memory;

pub use error::{DbError, Result};
pub use schema::{
    DataSourceRecord, EdgeId, EntityId, EntityNode, IndexKey, StitchEdge,
};
pub use store::{GraphRead, GraphStats, GraphStore, GraphTx};
pub use memory::InMemoryGraph;
