//! Two-phase batch driver.
//!
//! ```text
//! TwoPhaseBatch::begin ─┬─ Skipped(report)            DataSource already ingested
//!                       └─ Ready(PhaseOne)
//!                              ingest / ingest_xml    register records, queue links
//!                          finish ──► PhaseTwo
//!                              resolve                stitch queued links, complete DataSource
//! ```
//!
//! Phase two can only be reached by consuming phase one, so links are never
//! replayed before the whole input has been registered.

use std::io::{self, Read};

use serde::Serialize;
use stitcher_common::source_config::ExtractorSpec;
use stitcher_common::{KeyType, Payload, RawRecord, RelationKind, Result, Value};
use stitcher_db::EntityId;
use stitcher_kg::{DeferredLinks, ResolutionReport};
use tracing::{debug, error, info, instrument, warn};

use crate::datasource::{Completion, DataSourceRegistry};
use crate::normalise::RuleSet;
use crate::registrar::{Registrar, Registration};
use crate::xml_record::{parse_fragment, XmlElement};
use crate::xml_stream::{StreamControl, XmlStream};

/// A relationship a record declares towards another entity by key.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLink {
    pub kind: RelationKind,
    pub key: KeyType,
    pub value: String,
    pub attrs: Payload,
}

impl PendingLink {
    pub fn new(kind: RelationKind, key: KeyType, value: impl Into<String>) -> Self {
        Self { kind, key, value: value.into(), attrs: Payload::new() }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub source: String,
    /// DataSource was already ingested; nothing was read
    pub skipped: bool,
    pub records: usize,
    pub created: usize,
    pub merged: usize,
    pub attached: usize,
    pub filtered: usize,
    pub failed: usize,
    /// Links dropped by cleanup rules or with unusable key values
    pub links_dropped: usize,
    pub links: ResolutionReport,
}

impl BatchReport {
    pub fn stitched(&self) -> usize {
        self.links.stitched
    }

    pub fn unresolved(&self) -> usize {
        self.links.unresolved
    }

    pub fn rejected(&self) -> usize {
        self.links.rejected
    }

    /// Entities this batch is responsible for.
    pub fn instances(&self) -> usize {
        self.created + self.attached
    }
}

pub enum TwoPhaseBatch {
    Skipped(BatchReport),
    Ready(PhaseOne),
}

impl TwoPhaseBatch {
    /// Start a batch for the registrar's DataSource, or skip it when that
    /// source has already been ingested.
    pub fn begin(registry: DataSourceRegistry, registrar: Registrar, rules: RuleSet) -> Self {
        let source = registrar.source();
        let report = BatchReport { source: source.name().to_string(), ..Default::default() };
        if source.is_ingested() {
            info!(
                source = %source.name(),
                instances = source.instances(),
                "Batch skipped, data source already ingested"
            );
            return TwoPhaseBatch::Skipped(BatchReport { skipped: true, ..report });
        }
        TwoPhaseBatch::Ready(PhaseOne {
            registry,
            registrar,
            rules,
            links: DeferredLinks::new(),
            report,
            checksum: None,
            metadata: Payload::new(),
        })
    }
}

/// Registration phase: every record becomes an entity, links are queued.
pub struct PhaseOne {
    registry: DataSourceRegistry,
    registrar: Registrar,
    rules: RuleSet,
    links: DeferredLinks,
    report: BatchReport,
    checksum: Option<(String, u64)>,
    /// Free-form DataSource metadata set by the adapter
    metadata: Payload,
}

impl PhaseOne {
    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    pub fn pending_links(&self) -> usize {
        self.links.len()
    }

    /// Record the content checksum of the input, once it is known.
    pub fn checksum(&mut self, sha1: impl Into<String>, size: u64) {
        self.checksum = Some((sha1.into(), size));
    }

    /// Record a free-form DataSource property, e.g. an ontology title or
    /// version. Stored when the batch completes, alongside the key-binding
    /// metadata; a key set here wins over a binding entry of the same name.
    pub fn metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Register (or attach) one record and queue its links from every
    /// entity it touched. Errors are logged and counted; the batch goes on.
    pub fn ingest<I>(&mut self, record: &RawRecord, links: I) -> Vec<EntityId>
    where
        I: IntoIterator<Item = PendingLink>,
    {
        self.report.records += 1;

        let attach_only = self.registrar.has_references() && self.registrar.resolver().bindings().is_empty();
        let entities = if attach_only {
            match self.registrar.attach(record) {
                Ok(ids) => {
                    self.report.attached += ids.len();
                    if ids.is_empty() {
                        self.report.filtered += 1;
                    }
                    ids
                }
                Err(e) => {
                    self.fail(record, &e);
                    return Vec::new();
                }
            }
        } else {
            match self.registrar.register(record) {
                Ok(Some(Registration::Created(id))) => {
                    self.report.created += 1;
                    vec![id]
                }
                Ok(Some(Registration::Merged(id))) => {
                    self.report.merged += 1;
                    vec![id]
                }
                Ok(None) => {
                    self.report.filtered += 1;
                    Vec::new()
                }
                Err(e) => {
                    self.fail(record, &e);
                    return Vec::new();
                }
            }
        };

        if !entities.is_empty() {
            for link in links {
                for entity in &entities {
                    self.defer(*entity, link.clone());
                }
            }
        }
        entities
    }

    fn fail(&mut self, record: &RawRecord, e: &dyn std::fmt::Display) {
        self.report.failed += 1;
        error!(
            source = %self.report.source,
            fields = ?record.field_names().collect::<Vec<_>>(),
            error = %e,
            "Record failed, skipping"
        );
    }

    /// Queue one link after running it through the cleanup rules.
    pub fn defer(&mut self, source: EntityId, link: PendingLink) -> bool {
        let Some((kind, value)) = self.rules.apply(&link.kind, &link.value) else {
            debug!(%source, kind = %link.kind, value = %link.value, "Link dropped by rule");
            self.report.links_dropped += 1;
            return false;
        };
        match self.links.defer(source, kind, link.key, &value, link.attrs) {
            Ok(()) => true,
            Err(e) => {
                warn!(%source, key = %link.key, value = %link.value, error = %e, "Link target rejected");
                self.report.links_dropped += 1;
                false
            }
        }
    }

    /// Extract records from an XML dump and ingest each. `parse` turns one
    /// record element into a raw record and its links; `None` skips it.
    /// It also gets the stream control, so an adapter can stop the batch
    /// early with `set_done`. Fragments that fail to parse are logged with
    /// their raw bytes.
    #[instrument(skip_all, fields(source = %self.report.source, tag = %spec.tag))]
    pub fn ingest_xml<R, P>(&mut self, input: R, spec: &ExtractorSpec, mut parse: P) -> io::Result<usize>
    where
        R: Read,
        P: FnMut(&mut StreamControl, &XmlElement) -> Option<(RawRecord, Vec<PendingLink>)>,
    {
        let mut stream = XmlStream::from_spec(input, spec, |ctl: &mut StreamControl, bytes: &[u8]| {
            match parse_fragment(bytes) {
                Ok(element) => match parse(ctl, &element) {
                    Some((record, links)) => {
                        self.ingest(&record, links);
                    }
                    None => {
                        self.report.records += 1;
                        self.report.filtered += 1;
                    }
                },
                Err(e) => {
                    self.report.records += 1;
                    self.report.failed += 1;
                    warn!(
                        source = %self.report.source,
                        error = %e,
                        fragment = %String::from_utf8_lossy(bytes),
                        "Unparseable record fragment"
                    );
                }
            }
        });
        stream.start()
    }

    /// Close phase one. Nothing more can be registered afterwards.
    pub fn finish(self) -> PhaseTwo {
        info!(
            source = %self.report.source,
            records = self.report.records,
            created = self.report.created,
            merged = self.report.merged,
            attached = self.report.attached,
            filtered = self.report.filtered,
            failed = self.report.failed,
            links = self.links.len(),
            "Registration phase complete"
        );
        PhaseTwo {
            registry: self.registry,
            registrar: self.registrar,
            links: self.links,
            report: self.report,
            checksum: self.checksum,
            metadata: self.metadata,
        }
    }
}

/// Resolution phase: replay queued links and complete the DataSource.
pub struct PhaseTwo {
    registry: DataSourceRegistry,
    registrar: Registrar,
    links: DeferredLinks,
    report: BatchReport,
    checksum: Option<(String, u64)>,
    /// Free-form DataSource metadata set by the adapter
    metadata: Payload,
}

impl PhaseTwo {
    pub fn pending_links(&self) -> usize {
        self.links.len()
    }

    #[instrument(skip_all, fields(source = %self.report.source, links = self.links.len()))]
    pub fn resolve(self) -> Result<BatchReport> {
        let PhaseTwo { registry, registrar, links, mut report, checksum, metadata: extra } = self;

        report.links = links.resolve(registrar.graph().as_ref());

        let (sha1, size) = match checksum {
            Some((sha1, size)) => (Some(sha1), Some(size)),
            None => (None, None),
        };
        let mut metadata = registrar.metadata();
        metadata.extend(extra);
        registry.complete(
            registrar.source(),
            Completion {
                instances: report.instances() as u64,
                sha1,
                size,
                properties: registrar.observed_properties().to_vec(),
                metadata,
            },
        )?;

        info!(
            source = %report.source,
            records = report.records,
            created = report.created,
            merged = report.merged,
            stitched = report.stitched(),
            unresolved = report.unresolved(),
            rejected = report.rejected(),
            "Batch complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalise::{KeyBinding, KeyResolver, RuleAction};
    use std::sync::Arc;
    use stitcher_db::{GraphStore, InMemoryGraph};

    fn batch(graph: &Arc<dyn GraphStore>, name: &str, rules: RuleSet) -> TwoPhaseBatch {
        let registry = DataSourceRegistry::new(graph.clone());
        let handle = registry.register(name).unwrap();
        let resolver = KeyResolver::new().bind(KeyBinding::new("id", KeyType::Code));
        let registrar = Registrar::new(graph.clone(), handle, resolver).id_field("id");
        TwoPhaseBatch::begin(registry, registrar, rules)
    }

    fn class(id: &str) -> RawRecord {
        let mut r = RawRecord::new();
        r.put("id", id);
        r
    }

    fn no_links() -> Vec<PendingLink> {
        Vec::new()
    }

    fn ready(b: TwoPhaseBatch) -> PhaseOne {
        match b {
            TwoPhaseBatch::Ready(p) => p,
            TwoPhaseBatch::Skipped(_) => panic!("batch unexpectedly skipped"),
        }
    }

    #[test]
    fn test_links_resolve_after_all_records() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut one = ready(batch(&graph, "onto", RuleSet::new()));

        let c1 = one.ingest(&class("C1"), [PendingLink::new(RelationKind::SubClassOf, KeyType::Code, "C2")]);
        one.ingest(&class("C2"), no_links());
        assert_eq!(one.pending_links(), 1);

        let report = one.finish().resolve().unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.stitched(), 1);

        let edges = graph.edges_from(c1[0]).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, RelationKind::SubClassOf);
        assert_eq!(edges[0].key_value, "C2");
    }

    #[test]
    fn test_rules_drop_links() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut rules = RuleSet::new();
        rules.push("^ISBN:", RuleAction::Drop).unwrap();
        let mut one = ready(batch(&graph, "onto", rules));

        one.ingest(&class("C1"), [PendingLink::new(RelationKind::ExactMatch, KeyType::Code, "ISBN:1")]);
        assert_eq!(one.pending_links(), 0);
        assert_eq!(one.report().links_dropped, 1);
    }

    #[test]
    fn test_completed_source_is_skipped() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut one = ready(batch(&graph, "onto", RuleSet::new()));
        one.ingest(&class("C1"), no_links());
        one.checksum("abc", 3);
        one.finish().resolve().unwrap();

        match batch(&graph, "onto", RuleSet::new()) {
            TwoPhaseBatch::Skipped(report) => {
                assert!(report.skipped);
                assert_eq!(report.records, 0);
            }
            TwoPhaseBatch::Ready(_) => panic!("re-ingestion should be skipped"),
        }
        let ds = DataSourceRegistry::new(graph.clone()).find_by_name("onto").unwrap().unwrap();
        assert_eq!(ds.instances, 1);
        assert_eq!(ds.sha1.as_deref(), Some("abc"));
        assert_eq!(ds.properties, vec!["id"]);
    }

    #[test]
    fn test_ingest_xml_counts_bad_fragments() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut one = ready(batch(&graph, "xml", RuleSet::new()));
        let input = b"<root><c id=\"A\"></c><c id=\"B\"/></c><c><x></c></root>";
        let spec = ExtractorSpec { tag: "c".into(), max_record_bytes: None };

        let count = one
            .ingest_xml(&input[..], &spec, |_, el| {
                let mut r = RawRecord::new();
                r.put("id", el.attr("id")?);
                Some((r, Vec::new()))
            })
            .unwrap();

        // the second fragment carries a stray `</c>`, the third is unbalanced
        assert_eq!(count, 3);
        assert_eq!(one.report().records, 3);
        assert_eq!(one.report().failed, 2);
        assert_eq!(graph.stats().unwrap().entities, 1);
    }

    #[test]
    fn test_ingest_xml_parser_can_stop_the_batch() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut one = ready(batch(&graph, "xml", RuleSet::new()));
        let input: String = (0..50).map(|i| format!("<c id=\"C{i}\"></c>")).collect();
        let spec = ExtractorSpec { tag: "c".into(), max_record_bytes: None };

        let count = one
            .ingest_xml(input.as_bytes(), &spec, |ctl, el| {
                if ctl.count() == 4 {
                    ctl.set_done();
                }
                Some((class(el.attr("id")?), Vec::new()))
            })
            .unwrap();

        assert_eq!(count, 4);
        assert_eq!(one.report().records, 4);
        assert_eq!(one.report().created, 4);
        let report = one.finish().resolve().unwrap();
        assert_eq!(report.instances(), 4);
        assert_eq!(graph.stats().unwrap().entities, 4);
    }

    #[test]
    fn test_truncated_fragment_reaches_the_failure_count() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut one = ready(batch(&graph, "xml", RuleSet::new()));
        let spec = ExtractorSpec { tag: "c".into(), max_record_bytes: None };

        let count = one
            .ingest_xml(&b"<c id=\"A\"></c><c id=\"B\"><x/"[..], &spec, |_, el| {
                Some((class(el.attr("id")?), Vec::new()))
            })
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(one.report().created, 1);
        assert_eq!(one.report().failed, 1);
    }

    #[test]
    fn test_batch_metadata_is_stored_on_completion() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let mut one = ready(batch(&graph, "onto", RuleSet::new()));
        one.ingest(&class("C1"), no_links());
        one.metadata("title", "Toy Ontology");
        one.metadata("version", "2024-01-01");
        one.finish().resolve().unwrap();

        let ds = DataSourceRegistry::new(graph.clone()).find_by_name("onto").unwrap().unwrap();
        assert_eq!(ds.metadata["title"], Value::from("Toy Ontology"));
        assert_eq!(ds.metadata["version"], Value::from("2024-01-01"));
        assert_eq!(ds.metadata["IdField"], Value::from("id"));
    }
}
