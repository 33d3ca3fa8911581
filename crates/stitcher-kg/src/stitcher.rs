//! Cross-reference lookup and typed edge creation.

use std::sync::Arc;

use serde::Serialize;
use stitcher_common::{KeyPair, KeyType, Payload, RelationKind, Result, StitchError, Value};
use stitcher_db::{EdgeId, EntityId, GraphRead, GraphStore, GraphTx, IndexKey};
use tracing::debug;

/// Result of a successful `stitch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "edge", rename_all = "snake_case")]
pub enum StitchOutcome {
    /// A new edge was written.
    Created(EdgeId),
    /// An equivalent edge existed; new attribute values were merged into it.
    Updated(EdgeId),
    /// An equivalent edge existed and already carried every attribute value.
    Unchanged(EdgeId),
}

impl StitchOutcome {
    pub fn edge_id(&self) -> EdgeId {
        match self {
            StitchOutcome::Created(id) | StitchOutcome::Updated(id) | StitchOutcome::Unchanged(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, StitchOutcome::Created(_))
    }
}

/// Entity resolver and stitcher over a shared graph store.
#[derive(Clone)]
pub struct Stitcher {
    graph: Arc<dyn GraphStore>,
}

impl Stitcher {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    /// Get underlying graph reference.
    pub fn graph(&self) -> &dyn GraphStore {
        self.graph.as_ref()
    }

    /// Every entity, from any data source, indexed under `key` with the
    /// normalised form of `raw`. Order is unspecified.
    pub fn find(&self, key: KeyType, raw: &str) -> Result<std::vec::IntoIter<EntityId>> {
        self.find_pair(&KeyPair::new(key, raw)?)
    }

    pub fn find_pair(&self, pair: &KeyPair) -> Result<std::vec::IntoIter<EntityId>> {
        find_in(self.graph.as_ref(), pair)
    }

    /// Create (or reuse) an edge `from -> to` in its own transaction.
    pub fn stitch(
        &self,
        from: EntityId,
        to: EntityId,
        kind: &RelationKind,
        key_value: &str,
        attrs: &Payload,
    ) -> Result<StitchOutcome> {
        let mut tx = self.graph.begin()?;
        let outcome = stitch_in(tx.as_mut(), from, to, kind, key_value, attrs)?;
        tx.commit()?;
        Ok(outcome)
    }
}

/// `find` against any reader, including an open transaction.
pub fn find_in<R>(reader: &R, pair: &KeyPair) -> Result<std::vec::IntoIter<EntityId>>
where
    R: GraphRead + ?Sized,
{
    Ok(reader
        .find_by_index(&IndexKey::Key(pair.key), &pair.value)?
        .into_iter())
}

/// Stitch inside a caller-owned transaction.
///
/// Self-loops are rejected, as is a coreference between two entities that
/// came from the same data source. An edge of the same kind and key value
/// between the same pair is reused rather than duplicated.
pub fn stitch_in(
    tx: &mut dyn GraphTx,
    from: EntityId,
    to: EntityId,
    kind: &RelationKind,
    key_value: &str,
    attrs: &Payload,
) -> Result<StitchOutcome> {
    if from == to {
        return Err(StitchError::SelfLoop(from.to_string()));
    }

    let source = tx.require_entity(from)?;
    let target = tx.require_entity(to)?;

    if kind.is_coreference() {
        if let (Some(a), Some(b)) = (&source.source, &target.source) {
            if a == b {
                return Err(StitchError::SameSourceCoreference {
                    kind: kind.name(),
                    from: from.to_string(),
                    to: to.to_string(),
                    source_key: a.clone(),
                });
            }
        }
    }

    let mut candidates = tx.edges_from(from)?;
    if kind.is_symmetric() {
        candidates.extend(tx.edges_to(from)?);
    }

    if let Some(existing) = candidates
        .into_iter()
        .find(|edge| edge.connects(from, to, kind, key_value))
    {
        let novel = novel_attrs(&existing.attrs, attrs);
        if novel.is_empty() {
            return Ok(StitchOutcome::Unchanged(existing.id));
        }
        tx.merge_edge_attrs(existing.id, &novel)?;
        debug!(edge = %existing.id, %kind, key_value, "Merged attributes into existing edge");
        return Ok(StitchOutcome::Updated(existing.id));
    }

    let id = tx.create_edge(from, to, kind.clone(), key_value, attrs.clone())?;
    debug!(edge = %id, %from, %to, %kind, key_value, "Stitched");
    Ok(StitchOutcome::Created(id))
}

/// Attribute values in `incoming` that the existing edge does not carry yet.
fn novel_attrs(existing: &Payload, incoming: &Payload) -> Payload {
    incoming
        .iter()
        .filter_map(|(name, value)| {
            let known = existing.get(name).map(|v| v.scalars()).unwrap_or(&[]);
            let fresh: Vec<_> = value
                .scalars()
                .iter()
                .filter(|s| !known.contains(*s))
                .cloned()
                .collect();
            match fresh.len() {
                0 => None,
                1 => fresh.into_iter().next().map(|s| (name.clone(), Value::from(s))),
                _ => Some((name.clone(), Value::from(fresh))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use stitcher_db::InMemoryGraph;

    fn setup() -> (InMemoryGraph, Stitcher) {
        let graph = InMemoryGraph::new();
        let stitcher = Stitcher::new(Arc::new(graph.clone()));
        (graph, stitcher)
    }

    fn entity(graph: &InMemoryGraph, source: &str) -> EntityId {
        let mut tx = graph.begin().unwrap();
        let id = tx.create_entity(Payload::new(), BTreeSet::new(), Some(source)).unwrap();
        tx.commit().unwrap();
        id
    }

    fn attrs(name: &str, value: &str) -> Payload {
        let mut p = Payload::new();
        p.insert(name.to_string(), Value::from(value));
        p
    }

    #[test]
    fn test_stitch_creates_edge_visible_on_target() {
        let (graph, stitcher) = setup();
        let (a, b) = (entity(&graph, "s1"), entity(&graph, "s1"));

        let outcome = stitcher
            .stitch(a, b, &RelationKind::SubClassOf, "HP:0000118", &attrs("source", "HPO"))
            .unwrap();
        assert!(outcome.is_created());

        let edges = graph.edges_to(b).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key_value, "HP:0000118");
        assert_eq!(edges[0].kind, RelationKind::SubClassOf);
    }

    #[test]
    fn test_self_loop_rejected() {
        let (graph, stitcher) = setup();
        let a = entity(&graph, "s1");
        let err = stitcher
            .stitch(a, a, &RelationKind::ExactMatch, "x", &Payload::new())
            .unwrap_err();
        assert!(matches!(err, StitchError::SelfLoop(_)));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_same_source_coreference_rejected() {
        let (graph, stitcher) = setup();
        let (a, b) = (entity(&graph, "s1"), entity(&graph, "s1"));
        let err = stitcher
            .stitch(a, b, &RelationKind::Coreference(KeyType::Unii), "R16CO5Y76E", &Payload::new())
            .unwrap_err();
        assert!(matches!(err, StitchError::SameSourceCoreference { .. }));

        let c = entity(&graph, "s2");
        assert!(stitcher
            .stitch(a, c, &RelationKind::Coreference(KeyType::Unii), "R16CO5Y76E", &Payload::new())
            .is_ok());
    }

    #[test]
    fn test_restitch_is_idempotent_and_merges_new_attrs() {
        let (graph, stitcher) = setup();
        let (a, b) = (entity(&graph, "s1"), entity(&graph, "s2"));
        let kind = RelationKind::HasPhenotype;

        let first = stitcher.stitch(a, b, &kind, "HP:1", &attrs("frequency", "rare")).unwrap();
        let again = stitcher.stitch(a, b, &kind, "HP:1", &attrs("frequency", "rare")).unwrap();
        let more = stitcher.stitch(a, b, &kind, "HP:1", &attrs("frequency", "common")).unwrap();

        assert_eq!(again, StitchOutcome::Unchanged(first.edge_id()));
        assert_eq!(more, StitchOutcome::Updated(first.edge_id()));
        let edges = graph.edges_from(a).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].attrs["frequency"], Value::list(["rare", "common"]));
    }

    #[test]
    fn test_symmetric_kind_reuses_reverse_edge() {
        let (graph, stitcher) = setup();
        let (a, b) = (entity(&graph, "s1"), entity(&graph, "s2"));
        let first = stitcher.stitch(a, b, &RelationKind::ExactMatch, "MESH:D1", &Payload::new()).unwrap();
        let back = stitcher.stitch(b, a, &RelationKind::ExactMatch, "MESH:D1", &Payload::new()).unwrap();
        assert_eq!(back, StitchOutcome::Unchanged(first.edge_id()));

        // Directed kinds do not.
        let sub = stitcher.stitch(b, a, &RelationKind::SubClassOf, "MESH:D1", &Payload::new()).unwrap();
        assert!(sub.is_created());
    }

    #[test]
    fn test_find_normalises_value() {
        let (graph, stitcher) = setup();
        let a = entity(&graph, "s1");
        let b = entity(&graph, "s2");
        let mut tx = graph.begin().unwrap();
        tx.index(a, &IndexKey::Key(KeyType::Name), "ASPIRIN").unwrap();
        tx.index(b, &IndexKey::Key(KeyType::Name), "ASPIRIN").unwrap();
        tx.commit().unwrap();

        let mut found: Vec<_> = stitcher.find(KeyType::Name, "  aspirin ").unwrap().collect();
        found.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(stitcher.find(KeyType::Name, "ibuprofen").unwrap().count(), 0);
    }
}
