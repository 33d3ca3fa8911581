//! Entity registrar: upsert exactly one entity per raw record.
//!
//! With an id field, records sharing an id value within one DataSource merge
//! into a single entity. Without one, every record yields a fresh entity.
//! The create-or-merge and every index write for a record commit together.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use stitcher_common::{KeyPair, Payload, RawRecord, ReferenceSpec, Result, SourceConfig, Value};
use stitcher_db::{EntityId, GraphStore, GraphTx, IndexKey};
use tracing::{debug, warn};

use crate::datasource::SourceHandle;
use crate::normalise::{KeyResolution, KeyResolver};

/// Outcome of registering one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created(EntityId),
    Merged(EntityId),
}

impl Registration {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Registration::Created(id) | Registration::Merged(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

pub struct Registrar {
    graph: Arc<dyn GraphStore>,
    source: SourceHandle,
    label: String,
    id_field: Option<String>,
    name_field: Option<String>,
    resolver: KeyResolver,
    references: Vec<(ReferenceSpec, String)>,
    /// Property names in first-seen order
    properties: Vec<String>,
    seen: HashSet<String>,
}

impl Registrar {
    pub fn new(graph: Arc<dyn GraphStore>, source: SourceHandle, resolver: KeyResolver) -> Self {
        let label = source.label();
        Self {
            graph,
            source,
            label,
            id_field: None,
            name_field: None,
            resolver,
            references: Vec::new(),
            properties: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Build from an adapter configuration: key bindings, id/name fields and
    /// references.
    pub fn from_config(graph: Arc<dyn GraphStore>, source: SourceHandle, config: &SourceConfig) -> Self {
        let mut registrar = Self::new(graph, source, KeyResolver::from_config(config));
        registrar.id_field = config.source.id_field.clone();
        registrar.name_field = config.source.name_field.clone();
        for reference in &config.references {
            match config.reference_field(reference) {
                Some(field) => registrar.references.push((reference.clone(), field.to_string())),
                None => warn!(
                    source = %registrar.source.name(),
                    reference = %reference.name,
                    "Reference has no record field and no id field to fall back on, skipping"
                ),
            }
        }
        registrar
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    pub fn name_field(mut self, field: impl Into<String>) -> Self {
        self.name_field = Some(field.into());
        self
    }

    /// Attach records to entities of `reference.name` found via the value of
    /// `field`.
    pub fn reference(mut self, reference: ReferenceSpec, field: impl Into<String>) -> Self {
        self.references.push((reference, field.into()));
        self
    }

    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }

    /// Every property name registered so far, first-seen order.
    pub fn observed_properties(&self) -> &[String] {
        &self.properties
    }

    /// Binding metadata recorded on the DataSource at completion.
    pub fn metadata(&self) -> Payload {
        let mut metadata = Payload::new();
        let keys = self.resolver.key_types();
        if !keys.is_empty() {
            metadata.insert(
                "Stitches".to_string(),
                Value::list(keys.iter().map(|k| k.as_str().to_string())),
            );
        }
        for key in keys {
            metadata.insert(
                key.as_str().to_string(),
                Value::list(self.resolver.properties_for(key).into_iter().map(str::to_string)),
            );
        }
        if let Some(f) = &self.id_field {
            metadata.insert("IdField".to_string(), Value::from(f.as_str()));
        }
        if let Some(f) = &self.name_field {
            metadata.insert("NameField".to_string(), Value::from(f.as_str()));
        }
        metadata
    }

    fn observe(&mut self, payload: &Payload) {
        for name in payload.keys() {
            if self.seen.insert(name.clone()) {
                self.properties.push(name.clone());
            }
        }
    }

    fn id_value(&self, record: &RawRecord) -> Option<String> {
        let field = self.id_field.as_deref()?;
        let value = record.get(field);
        let id = value
            .and_then(Value::first)
            .map(|s| s.to_key_string().trim().to_string())
            .filter(|s| !s.is_empty());
        match (&id, value) {
            (None, _) => warn!(
                source = %self.source.name(),
                id_field = field,
                "Record has no id value, registering without id"
            ),
            (Some(id), Some(v)) if v.len() > 1 => warn!(
                source = %self.source.name(),
                id_field = field,
                %id,
                values = v.len(),
                "Record has several id values, using the first"
            ),
            _ => {}
        }
        id
    }

    fn log_diagnostics(&self, record: &RawRecord, resolution: &KeyResolution, id: Option<&str>) {
        for diagnostic in record.diagnostics().iter().chain(&resolution.diagnostics) {
            warn!(source = %self.source.name(), id = ?id, %diagnostic, "Field omitted");
        }
    }

    /// Find an entity of this source carrying `id` under the id field.
    fn lookup(&self, tx: &dyn GraphTx, field: &str, id: &str) -> Result<Option<EntityId>> {
        for candidate in tx.find_by_index(&IndexKey::Field(field.to_string()), id)? {
            let entity = tx.require_entity(candidate)?;
            if entity.source.as_deref() == Some(self.source.key()) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Register one record. `None` when the record is entirely filtered out.
    pub fn register(&mut self, record: &RawRecord) -> Result<Option<Registration>> {
        let resolution = self.resolver.resolve(record);
        if self.resolver.is_filtered_out(record, &resolution) {
            self.log_diagnostics(record, &resolution, None);
            debug!(source = %self.source.name(), "Record filtered out");
            return Ok(None);
        }
        let id = self.id_value(record);
        self.log_diagnostics(record, &resolution, id.as_deref());

        let payload: Payload = record
            .fields()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.observe(&payload);

        let mut tx = self.graph.begin()?;
        let existing = match (&self.id_field, &id) {
            (Some(field), Some(id)) => self.lookup(&*tx, field, id)?,
            _ => None,
        };

        let registration = match existing {
            Some(entity) => {
                let mut rest = payload;
                if let Some(field) = &self.id_field {
                    rest.remove(field);
                }
                tx.merge_entity_payload(entity, &rest)?;
                Registration::Merged(entity)
            }
            None => {
                let mut labels = BTreeSet::from([self.label.clone()]);
                labels.extend(resolution.labels.iter().cloned());
                let entity = tx.create_entity(payload, labels, Some(self.source.key()))?;
                if let (Some(field), Some(id)) = (&self.id_field, &id) {
                    tx.index(entity, &IndexKey::Field(field.clone()), id)?;
                }
                Registration::Created(entity)
            }
        };

        let entity = registration.entity_id();
        if !registration.is_created() {
            for label in &resolution.labels {
                tx.add_label(entity, label)?;
            }
        }
        for pair in &resolution.pairs {
            tx.index(entity, &IndexKey::Key(pair.key), &pair.value)?;
        }
        tx.commit()?;

        debug!(
            source = %self.source.name(),
            id = ?id,
            entity = %entity,
            created = registration.is_created(),
            keys = resolution.pairs.len(),
            "Registered record"
        );
        Ok(Some(registration))
    }

    /// Attach a record to entities already registered by the referenced
    /// sources. Returns the attached entity ids, possibly none.
    pub fn attach(&mut self, record: &RawRecord) -> Result<Vec<EntityId>> {
        if self.references.is_empty() {
            return Ok(Vec::new());
        }
        let payload: Payload = record
            .fields()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.observe(&payload);

        let mut attached = Vec::new();
        let mut tx = self.graph.begin()?;
        let sources = tx.data_sources()?;

        for (reference, field) in &self.references {
            let Some(target) = sources.iter().find(|ds| ds.name == reference.name) else {
                warn!(
                    source = %self.source.name(),
                    reference = %reference.name,
                    "Referenced data source is not registered"
                );
                continue;
            };
            let Some(value) = record.get(field) else {
                continue;
            };
            for scalar in value.scalars() {
                let pair = match KeyPair::new(reference.key, &scalar.to_key_string()) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(source = %self.source.name(), %field, error = %e, "Reference value rejected");
                        continue;
                    }
                };
                for candidate in tx.find_by_index(&IndexKey::Key(pair.key), &pair.value)? {
                    if attached.contains(&candidate) {
                        continue;
                    }
                    let entity = tx.require_entity(candidate)?;
                    if entity.source.as_deref() != Some(target.key.as_str()) {
                        continue;
                    }
                    tx.merge_entity_payload(candidate, &payload)?;
                    tx.add_label(candidate, &self.label)?;
                    attached.push(candidate);
                }
            }
        }
        tx.commit()?;

        if attached.is_empty() {
            debug!(source = %self.source.name(), "Record matched no referenced entity");
        }
        Ok(attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSourceRegistry;
    use crate::normalise::KeyBinding;
    use stitcher_common::KeyType;
    use stitcher_db::InMemoryGraph;

    fn setup(name: &str) -> (Arc<dyn GraphStore>, SourceHandle) {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let handle = DataSourceRegistry::new(graph.clone()).register(name).unwrap();
        (graph, handle)
    }

    fn drug(id: &str, name: &str) -> RawRecord {
        let mut r = RawRecord::new();
        r.put("id", id).put("name", name);
        r
    }

    fn resolver() -> KeyResolver {
        KeyResolver::new()
            .bind(KeyBinding::new("id", KeyType::Code))
            .bind(KeyBinding::new("name", KeyType::Name))
    }

    #[test]
    fn test_create_indexes_and_labels() {
        let (graph, handle) = setup("drugs");
        let mut registrar = Registrar::new(graph.clone(), handle, resolver()).id_field("id");

        let reg = registrar.register(&drug("DB00945", "Aspirin")).unwrap().unwrap();
        assert!(reg.is_created());

        let entity = graph.require_entity(reg.entity_id()).unwrap();
        assert!(entity.has_label("S_DRUGS"));
        assert_eq!(
            graph.find_by_index(&IndexKey::Key(KeyType::Name), "ASPIRIN").unwrap(),
            vec![reg.entity_id()]
        );
    }

    #[test]
    fn test_same_id_merges() {
        let (graph, handle) = setup("drugs");
        let mut registrar = Registrar::new(graph.clone(), handle, resolver()).id_field("id");

        let first = registrar.register(&drug("DB00945", "Aspirin")).unwrap().unwrap();
        let second = registrar.register(&drug("DB00945", "ASA")).unwrap().unwrap();
        assert_eq!(second, Registration::Merged(first.entity_id()));

        let entity = graph.require_entity(first.entity_id()).unwrap();
        assert_eq!(entity.payload["name"], Value::list(["Aspirin", "ASA"]));
        assert_eq!(entity.payload["id"], Value::from("DB00945"));
        assert_eq!(graph.stats().unwrap().entities, 1);
        // the merged name is findable too
        assert_eq!(
            graph.find_by_index(&IndexKey::Key(KeyType::Name), "ASA").unwrap(),
            vec![first.entity_id()]
        );
    }

    #[test]
    fn test_without_id_field_every_record_is_new() {
        let (graph, handle) = setup("drugs");
        let mut registrar = Registrar::new(graph.clone(), handle, resolver());
        registrar.register(&drug("DB00945", "Aspirin")).unwrap();
        registrar.register(&drug("DB00945", "Aspirin")).unwrap();
        assert_eq!(graph.stats().unwrap().entities, 2);
    }

    #[test]
    fn test_id_unique_per_source_only() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let registry = DataSourceRegistry::new(graph.clone());
        let mut a = Registrar::new(graph.clone(), registry.register("a").unwrap(), resolver()).id_field("id");
        let mut b = Registrar::new(graph.clone(), registry.register("b").unwrap(), resolver()).id_field("id");

        let ra = a.register(&drug("1", "x")).unwrap().unwrap();
        let rb = b.register(&drug("1", "x")).unwrap().unwrap();
        assert!(ra.is_created() && rb.is_created());
        assert_ne!(ra.entity_id(), rb.entity_id());
    }

    #[test]
    fn test_fully_blacklisted_record_filtered() {
        let (graph, handle) = setup("drugs");
        let resolver = KeyResolver::new().bind(KeyBinding::new("name", KeyType::Name).blacklist(["Unknown"]));
        let mut registrar = Registrar::new(graph.clone(), handle, resolver);

        let mut r = RawRecord::new();
        r.put("name", "unknown");
        assert!(registrar.register(&r).unwrap().is_none());
        assert!(registrar.register(&RawRecord::new()).unwrap().is_none());
        assert_eq!(graph.stats().unwrap().entities, 0);
    }

    #[test]
    fn test_keyword_values_become_labels() {
        let (graph, handle) = setup("drugs");
        let resolver = resolver().bind(KeyBinding::new("group", KeyType::Keyword));
        let mut registrar = Registrar::new(graph.clone(), handle, resolver);

        let mut r = drug("1", "Aspirin");
        r.put("group", "approved");
        let reg = registrar.register(&r).unwrap().unwrap();
        let entity = graph.require_entity(reg.entity_id()).unwrap();
        assert!(entity.has_label("approved"));
    }

    #[test]
    fn test_observed_properties_and_metadata() {
        let (graph, handle) = setup("drugs");
        let mut registrar = Registrar::new(graph, handle, resolver()).id_field("id").name_field("name");
        let mut r = drug("1", "Aspirin");
        r.put("cas", "50-78-2");
        registrar.register(&r).unwrap();

        assert_eq!(registrar.observed_properties(), ["cas", "id", "name"]);
        let metadata = registrar.metadata();
        assert_eq!(metadata["IdField"], Value::from("id"));
        assert_eq!(metadata["NameField"], Value::from("name"));
        assert_eq!(metadata["Stitches"], Value::list(["code", "name"]));
        assert_eq!(metadata["name"], Value::list(["name"]));
    }

    #[test]
    fn test_attach_to_referenced_source() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
        let registry = DataSourceRegistry::new(graph.clone());
        let mut drugs =
            Registrar::new(graph.clone(), registry.register("drugs").unwrap(), resolver()).id_field("id");
        let target = drugs.register(&drug("DB00945", "Aspirin")).unwrap().unwrap();

        let reference = ReferenceSpec { name: "drugs".into(), key: KeyType::Code, id: None };
        let mut labels = Registrar::new(graph.clone(), registry.register("labels").unwrap(), KeyResolver::new())
            .reference(reference, "drug");

        let mut r = RawRecord::new();
        r.put("drug", "DB00945").put("route", "oral");
        let attached = labels.attach(&r).unwrap();
        assert_eq!(attached, vec![target.entity_id()]);

        let entity = graph.require_entity(target.entity_id()).unwrap();
        assert!(entity.has_label("S_LABELS"));
        assert_eq!(entity.payload["route"], Value::from("oral"));

        let mut miss = RawRecord::new();
        miss.put("drug", "DB99999");
        assert!(labels.attach(&miss).unwrap().is_empty());
    }
}
