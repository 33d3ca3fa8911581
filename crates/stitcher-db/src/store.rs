//! Graph store interface.
//!
//! Reads are available both on the store handle and inside a transaction.
//! All writes go through a `GraphTx`; a transaction that is dropped without
//! `commit` is rolled back.

use std::collections::BTreeSet;

use stitcher_common::{Payload, RelationKind};

use crate::error::Result;
use crate::schema::{DataSourceRecord, EdgeId, EntityId, EntityNode, IndexKey, StitchEdge};

/// Read access to the graph.
pub trait GraphRead {
    /// Every entity indexed under `key` with exactly `value`.
    fn find_by_index(&self, key: &IndexKey, value: &str) -> Result<Vec<EntityId>>;

    fn entity(&self, id: EntityId) -> Result<Option<EntityNode>>;

    /// Edges leaving `id`.
    fn edges_from(&self, id: EntityId) -> Result<Vec<StitchEdge>>;

    /// Edges arriving at `id`.
    fn edges_to(&self, id: EntityId) -> Result<Vec<StitchEdge>>;

    fn data_source(&self, key: &str) -> Result<Option<DataSourceRecord>>;

    /// All data sources ordered by name.
    fn data_sources(&self) -> Result<Vec<DataSourceRecord>>;

    /// Fetch an entity that must exist.
    fn require_entity(&self, id: EntityId) -> Result<EntityNode> {
        self.entity(id)?
            .ok_or_else(|| crate::error::DbError::NotFound(id.to_string()))
    }
}

/// One atomic unit of work.
pub trait GraphTx: GraphRead {
    fn create_entity(
        &mut self,
        payload: Payload,
        labels: BTreeSet<String>,
        source: Option<&str>,
    ) -> Result<EntityId>;

    /// Accumulate `payload` into the entity's payload without losing values.
    fn merge_entity_payload(&mut self, id: EntityId, payload: &Payload) -> Result<()>;

    /// Returns false when the label was already present.
    fn add_label(&mut self, id: EntityId, label: &str) -> Result<bool>;

    /// Returns false when the entry already existed.
    fn index(&mut self, id: EntityId, key: &IndexKey, value: &str) -> Result<bool>;

    fn create_edge(
        &mut self,
        from: EntityId,
        to: EntityId,
        kind: RelationKind,
        key_value: &str,
        attrs: Payload,
    ) -> Result<EdgeId>;

    /// Accumulate `attrs` into an existing edge's attributes.
    fn merge_edge_attrs(&mut self, id: EdgeId, attrs: &Payload) -> Result<()>;

    /// Insert or replace a data source record.
    fn put_data_source(&mut self, record: DataSourceRecord) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// A transactional property-graph store.
pub trait GraphStore: GraphRead + Send + Sync {
    fn begin(&self) -> Result<Box<dyn GraphTx + '_>>;

    fn stats(&self) -> Result<GraphStats>;
}

/// Store-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub entities: usize,
    pub edges: usize,
    pub index_entries: usize,
    pub data_sources: usize,
}
