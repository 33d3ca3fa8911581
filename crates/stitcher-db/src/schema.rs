//! Persisted graph schema: entities, stitch edges, and data sources.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stitcher_common::{KeyType, Payload, RelationKind};
use uuid::Uuid;

pub type EntityId = Uuid;
pub type EdgeId = Uuid;

// =============================================================================
// Index keys
// =============================================================================

/// Name of a value index.
///
/// Identity keys are indexed under their `KeyType`; a source's id field is
/// indexed under the raw field name so the Registrar can find the entity a
/// record id was registered as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKey {
    Key(KeyType),
    Field(String),
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Key(key) => write!(f, "{key}"),
            IndexKey::Field(field) => write!(f, "field:{field}"),
        }
    }
}

impl From<KeyType> for IndexKey {
    fn from(key: KeyType) -> Self {
        IndexKey::Key(key)
    }
}

// =============================================================================
// Entity Schema
// =============================================================================

/// Knowledge-graph node holding merged record properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: EntityId,
    pub payload: Payload,
    pub labels: BTreeSet<String>,
    /// Key of the DataSource that first registered this entity
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EntityNode {
    pub fn new(payload: Payload, labels: BTreeSet<String>, source: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            labels,
            source,
            created_at: Utc::now(),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

// =============================================================================
// Edge Schema
// =============================================================================

/// Directed, typed, attributed relationship between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchEdge {
    pub id: EdgeId,
    pub from: EntityId,
    pub to: EntityId,
    pub kind: RelationKind,
    /// Key value that justified the edge
    pub key_value: String,
    pub attrs: Payload,
    pub created_at: DateTime<Utc>,
}

impl StitchEdge {
    pub fn new(
        from: EntityId,
        to: EntityId,
        kind: RelationKind,
        key_value: impl Into<String>,
        attrs: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            kind,
            key_value: key_value.into(),
            attrs,
            created_at: Utc::now(),
        }
    }

    /// True when this edge links `a` and `b` as `kind` with `key_value`.
    /// Symmetric kinds match in either direction.
    pub fn connects(&self, a: EntityId, b: EntityId, kind: &RelationKind, key_value: &str) -> bool {
        if &self.kind != kind || self.key_value != key_value {
            return false;
        }
        (self.from == a && self.to == b)
            || (kind.is_symmetric() && self.from == b && self.to == a)
    }
}

// =============================================================================
// DataSource Schema
// =============================================================================

/// Provenance and idempotency record for one ingestion batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceRecord {
    /// First 9 hex chars of a SHA-1 digest
    pub key: String,
    pub name: String,
    /// Origin locator (file:// URI, URL or path)
    pub uri: Option<String>,
    /// SHA-1 of the input content (hex)
    pub sha1: Option<String>,
    pub size: Option<u64>,
    pub instances: u64,
    /// Observed property names, in first-seen order
    pub properties: Vec<String>,
    /// Free-form adapter-set metadata (title, version, binding layout)
    pub metadata: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSourceRecord {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            name: name.into(),
            uri: None,
            sha1: None,
            size: None,
            instances: 0,
            properties: Vec::new(),
            metadata: Payload::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A positive instance count makes re-ingestion a no-op.
    pub fn is_ingested(&self) -> bool {
        self.instances > 0
    }

    /// Label attached to every entity this source registers.
    pub fn label(&self) -> String {
        format!("S_{}", self.name.to_uppercase().replace(char::is_whitespace, "_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_edge_matches_both_directions() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let edge = StitchEdge::new(a, b, RelationKind::ExactMatch, "MESH:D001", Payload::new());
        assert!(edge.connects(a, b, &RelationKind::ExactMatch, "MESH:D001"));
        assert!(edge.connects(b, a, &RelationKind::ExactMatch, "MESH:D001"));

        let edge = StitchEdge::new(a, b, RelationKind::SubClassOf, "HP:1", Payload::new());
        assert!(!edge.connects(b, a, &RelationKind::SubClassOf, "HP:1"));
        assert!(!edge.connects(a, b, &RelationKind::SubClassOf, "HP:2"));
    }

    #[test]
    fn test_source_label() {
        let ds = DataSourceRecord::new("abc123def", "ClinVar Variation");
        assert_eq!(ds.label(), "S_CLINVAR_VARIATION");
        assert!(!ds.is_ingested());
    }

    #[test]
    fn test_index_key_display() {
        assert_eq!(IndexKey::Key(KeyType::Unii).to_string(), "unii");
        assert_eq!(IndexKey::Field("id".into()).to_string(), "field:id");
    }
}
