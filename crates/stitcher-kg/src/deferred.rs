//! Deferred links for batches whose records reference each other out of order.
//!
//! Phase 1 registers every record and queues its outgoing relationships as
//! `DeferredLink`s. Phase 2 replays the queue once the whole input has been
//! consumed: each link is looked up by key and stitched in its own
//! transaction, so one failing link never rolls back another. Targets that
//! still cannot be found are logged and dropped.

use serde::Serialize;
use stitcher_common::{KeyPair, KeyType, Payload, RelationKind, Result};
use stitcher_db::{EntityId, GraphStore};
use tracing::{debug, info, instrument, warn};

use crate::stitcher::{find_in, stitch_in, StitchOutcome};

/// A relationship declared during phase 1, resolved during phase 2.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredLink {
    pub source: EntityId,
    pub kind: RelationKind,
    pub target: KeyPair,
    pub attrs: Payload,
}

/// Phase-2 tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    /// Links replayed
    pub links: usize,
    /// Edges newly created
    pub stitched: usize,
    /// Edges that already existed (attributes possibly merged)
    pub existing: usize,
    /// Links whose target key matched no entity
    pub unresolved: usize,
    /// Edges refused by stitch policy (self-loop, same-source coreference)
    pub rejected: usize,
    /// Links whose transaction failed and was rolled back
    pub failed: usize,
}

impl ResolutionReport {
    fn absorb(&mut self, other: ResolutionReport) {
        self.stitched += other.stitched;
        self.existing += other.existing;
        self.rejected += other.rejected;
    }
}

/// Queue of links awaiting phase 2.
#[derive(Debug, Default)]
pub struct DeferredLinks {
    links: Vec<DeferredLink>,
}

impl DeferredLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, link: DeferredLink) {
        self.links.push(link);
    }

    /// Queue `source -kind-> (key, raw)`. A raw value that does not normalise
    /// under `key` is an error and nothing is queued.
    pub fn defer(
        &mut self,
        source: EntityId,
        kind: RelationKind,
        key: KeyType,
        raw: &str,
        attrs: Payload,
    ) -> Result<()> {
        let target = KeyPair::new(key, raw)?;
        self.links.push(DeferredLink { source, kind, target, attrs });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredLink> {
        self.links.iter()
    }

    /// Replay every queued link against `graph`, consuming the queue.
    #[instrument(skip_all, fields(links = self.links.len()))]
    pub fn resolve(self, graph: &dyn GraphStore) -> ResolutionReport {
        let mut report = ResolutionReport { links: self.links.len(), ..Default::default() };

        for link in self.links {
            match resolve_link(graph, &link) {
                Ok(Some(outcome)) => report.absorb(outcome),
                Ok(None) => {
                    report.unresolved += 1;
                    warn!(
                        source = %link.source,
                        kind = %link.kind,
                        target = %link.target,
                        "Unresolved deferred link"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        source = %link.source,
                        kind = %link.kind,
                        target = %link.target,
                        error = %e,
                        "Deferred link failed, rolled back"
                    );
                }
            }
        }

        if report.unresolved > 0 {
            warn!(unresolved = report.unresolved, links = report.links, "Deferred links left unresolved");
        }
        info!(
            links = report.links,
            stitched = report.stitched,
            existing = report.existing,
            unresolved = report.unresolved,
            rejected = report.rejected,
            failed = report.failed,
            "Resolved deferred links"
        );
        report
    }
}

impl Extend<DeferredLink> for DeferredLinks {
    fn extend<I: IntoIterator<Item = DeferredLink>>(&mut self, iter: I) {
        self.links.extend(iter);
    }
}

/// One link, one transaction. `Ok(None)` when the target key matched nothing.
fn resolve_link(graph: &dyn GraphStore, link: &DeferredLink) -> Result<Option<ResolutionReport>> {
    let mut tx = graph.begin()?;
    let targets: Vec<EntityId> = find_in(tx.as_ref(), &link.target)?.collect();
    if targets.is_empty() {
        return Ok(None);
    }

    let mut tally = ResolutionReport::default();
    for target in targets {
        match stitch_in(tx.as_mut(), link.source, target, &link.kind, &link.target.value, &link.attrs) {
            Ok(StitchOutcome::Created(_)) => tally.stitched += 1,
            Ok(_) => tally.existing += 1,
            Err(e) if e.is_rejection() => {
                debug!(source = %link.source, %target, reason = %e, "Deferred link rejected");
                tally.rejected += 1;
            }
            Err(e) => {
                tx.rollback()?;
                return Err(e);
            }
        }
    }
    tx.commit()?;
    Ok(Some(tally))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use stitcher_db::{GraphRead, IndexKey, InMemoryGraph};

    fn register(graph: &InMemoryGraph, uri: &str) -> EntityId {
        let mut tx = graph.begin().unwrap();
        let id = tx.create_entity(Payload::new(), BTreeSet::new(), Some("onto")).unwrap();
        tx.index(id, &IndexKey::Key(KeyType::Uri), uri).unwrap();
        tx.commit().unwrap();
        id
    }

    #[test]
    fn test_out_of_order_subclass_resolves() {
        let graph = InMemoryGraph::new();
        let mut links = DeferredLinks::new();

        // C1 declares subClassOf C2 before C2 is registered.
        let c1 = register(&graph, "http://example.org/C1");
        links
            .defer(c1, RelationKind::SubClassOf, KeyType::Uri, "http://example.org/C2", Payload::new())
            .unwrap();
        let c2 = register(&graph, "http://example.org/C2");

        let report = links.resolve(&graph);
        assert_eq!(report.stitched, 1);
        assert_eq!(report.unresolved, 0);

        let edges = graph.edges_from(c1).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, c2);
        assert_eq!(edges[0].kind, RelationKind::SubClassOf);
    }

    #[test]
    fn test_unresolved_links_are_counted_and_dropped() {
        let graph = InMemoryGraph::new();
        let c1 = register(&graph, "http://example.org/C1");
        let mut links = DeferredLinks::new();
        links
            .defer(c1, RelationKind::SubClassOf, KeyType::Uri, "http://example.org/missing", Payload::new())
            .unwrap();

        let report = links.resolve(&graph);
        assert_eq!(report, ResolutionReport { links: 1, unresolved: 1, ..Default::default() });
        assert!(graph.edges_from(c1).unwrap().is_empty());
    }

    #[test]
    fn test_self_reference_is_rejected_not_failed() {
        let graph = InMemoryGraph::new();
        let c1 = register(&graph, "http://example.org/C1");
        let mut links = DeferredLinks::new();
        links
            .defer(c1, RelationKind::EquivalentClass, KeyType::Uri, "http://example.org/C1", Payload::new())
            .unwrap();

        let report = links.resolve(&graph);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_failed_link_does_not_undo_others() {
        let graph = InMemoryGraph::new();
        let c1 = register(&graph, "http://example.org/C1");
        let c2 = register(&graph, "http://example.org/C2");
        let ghost = uuid::Uuid::new_v4();

        let mut links = DeferredLinks::new();
        links.defer(c1, RelationKind::SubClassOf, KeyType::Uri, "http://example.org/C2", Payload::new()).unwrap();
        links.defer(ghost, RelationKind::SubClassOf, KeyType::Uri, "http://example.org/C2", Payload::new()).unwrap();

        let store: Arc<dyn GraphStore> = Arc::new(graph.clone());
        let report = links.resolve(store.as_ref());
        assert_eq!(report.stitched, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(graph.edges_to(c2).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_target_value_not_queued() {
        let mut links = DeferredLinks::new();
        let err = links.defer(uuid::Uuid::new_v4(), RelationKind::SubClassOf, KeyType::Pmid, "abc", Payload::new());
        assert!(err.is_err());
        assert!(links.is_empty());
    }
}
