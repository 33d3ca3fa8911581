//! Embedded in-memory graph store.
//!
//! All state lives behind one `RwLock`. A write transaction holds the write
//! guard for its whole lifetime, so readers never observe a half-applied
//! registration, and keeps an undo journal that is replayed on rollback or
//! when the transaction is dropped uncommitted.
//!
//! The store can be persisted as a JSON snapshot with `flush()`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stitcher_common::{merge_payload, Payload, RelationKind};
use tracing::{debug, info, warn};

use crate::error::{DbError, Result};
use crate::schema::{DataSourceRecord, EdgeId, EntityId, EntityNode, IndexKey, StitchEdge};
use crate::store::{GraphRead, GraphStats, GraphStore, GraphTx};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct GraphState {
    entities: HashMap<EntityId, EntityNode>,
    edges: HashMap<EdgeId, StitchEdge>,
    outgoing: HashMap<EntityId, Vec<EdgeId>>,
    incoming: HashMap<EntityId, Vec<EdgeId>>,
    index: HashMap<IndexKey, HashMap<String, BTreeSet<EntityId>>>,
    data_sources: HashMap<String, DataSourceRecord>,
}

impl GraphState {
    fn find_by_index(&self, key: &IndexKey, value: &str) -> Vec<EntityId> {
        self.index
            .get(key)
            .and_then(|values| values.get(value))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn entity(&self, id: EntityId) -> Option<EntityNode> {
        self.entities.get(&id).cloned()
    }

    fn edges(&self, adjacency: &HashMap<EntityId, Vec<EdgeId>>, id: EntityId) -> Vec<StitchEdge> {
        adjacency
            .get(&id)
            .map(|ids| ids.iter().filter_map(|e| self.edges.get(e).cloned()).collect())
            .unwrap_or_default()
    }

    fn data_sources(&self) -> Vec<DataSourceRecord> {
        let mut sources: Vec<_> = self.data_sources.values().cloned().collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.key.cmp(&b.key)));
        sources
    }

    fn stats(&self) -> GraphStats {
        GraphStats {
            entities: self.entities.len(),
            edges: self.edges.len(),
            index_entries: self
                .index
                .values()
                .flat_map(|values| values.values())
                .map(BTreeSet::len)
                .sum(),
            data_sources: self.data_sources.len(),
        }
    }

    fn insert_edge(&mut self, edge: StitchEdge) {
        self.outgoing.entry(edge.from).or_default().push(edge.id);
        self.incoming.entry(edge.to).or_default().push(edge.id);
        self.edges.insert(edge.id, edge);
    }

    fn remove_edge(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges.remove(&id) {
            if let Some(ids) = self.outgoing.get_mut(&edge.from) {
                ids.retain(|e| *e != id);
            }
            if let Some(ids) = self.incoming.get_mut(&edge.to) {
                ids.retain(|e| *e != id);
            }
        }
    }

    fn unindex(&mut self, key: &IndexKey, value: &str, id: EntityId) {
        if let Some(values) = self.index.get_mut(key) {
            if let Some(ids) = values.get_mut(value) {
                ids.remove(&id);
                if ids.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.index.remove(key);
            }
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entities: Vec<EntityNode>,
    edges: Vec<StitchEdge>,
    index: Vec<IndexEntry>,
    data_sources: Vec<DataSourceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    key: IndexKey,
    value: String,
    entities: Vec<EntityId>,
}

impl From<&GraphState> for Snapshot {
    fn from(state: &GraphState) -> Self {
        let mut entities: Vec<_> = state.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut edges: Vec<_> = state.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut index: Vec<IndexEntry> = state
            .index
            .iter()
            .flat_map(|(key, values)| {
                values.iter().map(move |(value, ids)| IndexEntry {
                    key: key.clone(),
                    value: value.clone(),
                    entities: ids.iter().copied().collect(),
                })
            })
            .collect();
        index.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.value.cmp(&b.value)));

        Self { entities, edges, index, data_sources: state.data_sources() }
    }
}

impl TryFrom<Snapshot> for GraphState {
    type Error = DbError;

    fn try_from(snapshot: Snapshot) -> Result<Self> {
        let mut state = GraphState::default();
        for entity in snapshot.entities {
            state.entities.insert(entity.id, entity);
        }
        for edge in snapshot.edges {
            for end in [edge.from, edge.to] {
                if !state.entities.contains_key(&end) {
                    return Err(DbError::InvalidSnapshot(format!(
                        "edge {} references unknown entity {}",
                        edge.id, end
                    )));
                }
            }
            state.insert_edge(edge);
        }
        for entry in snapshot.index {
            let ids = state
                .index
                .entry(entry.key)
                .or_default()
                .entry(entry.value)
                .or_default();
            ids.extend(entry.entities);
        }
        for source in snapshot.data_sources {
            state.data_sources.insert(source.key.clone(), source);
        }
        Ok(state)
    }
}

// =============================================================================
// Store handle
// =============================================================================

/// Main graph store handle. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraph {
    state: Arc<RwLock<GraphState>>,
    path: Option<PathBuf>,
}

impl InMemoryGraph {
    /// A purely in-memory store with nowhere to flush to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the snapshot at `path`, or start empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            let state = GraphState::try_from(snapshot)?;
            info!(
                path = %path.display(),
                entities = state.entities.len(),
                edges = state.edges.len(),
                "Loaded graph snapshot"
            );
            state
        } else {
            debug!(path = %path.display(), "No snapshot yet, starting empty graph");
            GraphState::default()
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        })
    }

    /// Snapshot location, if the store was opened from a path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist to the path the store was opened from. No-op for `new()` stores.
    pub fn flush(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    /// Write a snapshot atomically: temp file in the target directory, then rename.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = Snapshot::from(&*self.read()?);

        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(&mut tmp, &snapshot)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| DbError::Io(e.error))?;

        debug!(
            path = %path.display(),
            entities = snapshot.entities.len(),
            edges = snapshot.edges.len(),
            "Flushed graph snapshot"
        );
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphState>> {
        self.state.read().map_err(|_| DbError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphState>> {
        self.state.write().map_err(|_| DbError::Poisoned)
    }
}

impl GraphRead for InMemoryGraph {
    fn find_by_index(&self, key: &IndexKey, value: &str) -> Result<Vec<EntityId>> {
        Ok(self.read()?.find_by_index(key, value))
    }

    fn entity(&self, id: EntityId) -> Result<Option<EntityNode>> {
        Ok(self.read()?.entity(id))
    }

    fn edges_from(&self, id: EntityId) -> Result<Vec<StitchEdge>> {
        let state = self.read()?;
        Ok(state.edges(&state.outgoing, id))
    }

    fn edges_to(&self, id: EntityId) -> Result<Vec<StitchEdge>> {
        let state = self.read()?;
        Ok(state.edges(&state.incoming, id))
    }

    fn data_source(&self, key: &str) -> Result<Option<DataSourceRecord>> {
        Ok(self.read()?.data_sources.get(key).cloned())
    }

    fn data_sources(&self) -> Result<Vec<DataSourceRecord>> {
        Ok(self.read()?.data_sources())
    }
}

impl GraphStore for InMemoryGraph {
    fn begin(&self) -> Result<Box<dyn GraphTx + '_>> {
        Ok(Box::new(MemoryTx {
            state: self.write()?,
            journal: Vec::new(),
            open: true,
        }))
    }

    fn stats(&self) -> Result<GraphStats> {
        Ok(self.read()?.stats())
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Inverse of one applied write.
#[derive(Debug)]
enum Undo {
    CreatedEntity(EntityId),
    Payload { id: EntityId, previous: Payload },
    Label { id: EntityId, label: String },
    Indexed { key: IndexKey, value: String, id: EntityId },
    CreatedEdge(EdgeId),
    EdgeAttrs { id: EdgeId, previous: Payload },
    DataSource { key: String, previous: Option<DataSourceRecord> },
}

/// Write transaction over an `InMemoryGraph`.
pub struct MemoryTx<'a> {
    state: RwLockWriteGuard<'a, GraphState>,
    journal: Vec<Undo>,
    open: bool,
}

impl MemoryTx<'_> {
    fn entity_mut(&mut self, id: EntityId) -> Result<&mut EntityNode> {
        self.state
            .entities
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(id.to_string()))
    }

    fn undo(&mut self) {
        let writes = self.journal.len();
        while let Some(op) = self.journal.pop() {
            let state = &mut *self.state;
            match op {
                Undo::CreatedEntity(id) => {
                    state.entities.remove(&id);
                }
                Undo::Payload { id, previous } => {
                    if let Some(entity) = state.entities.get_mut(&id) {
                        entity.payload = previous;
                    }
                }
                Undo::Label { id, label } => {
                    if let Some(entity) = state.entities.get_mut(&id) {
                        entity.labels.remove(&label);
                    }
                }
                Undo::Indexed { key, value, id } => state.unindex(&key, &value, id),
                Undo::CreatedEdge(id) => state.remove_edge(id),
                Undo::EdgeAttrs { id, previous } => {
                    if let Some(edge) = state.edges.get_mut(&id) {
                        edge.attrs = previous;
                    }
                }
                Undo::DataSource { key, previous } => match previous {
                    Some(record) => {
                        state.data_sources.insert(key, record);
                    }
                    None => {
                        state.data_sources.remove(&key);
                    }
                },
            }
        }
        debug!(writes, "Rolled back transaction");
    }
}

impl GraphRead for MemoryTx<'_> {
    fn find_by_index(&self, key: &IndexKey, value: &str) -> Result<Vec<EntityId>> {
        Ok(self.state.find_by_index(key, value))
    }

    fn entity(&self, id: EntityId) -> Result<Option<EntityNode>> {
        Ok(self.state.entity(id))
    }

    fn edges_from(&self, id: EntityId) -> Result<Vec<StitchEdge>> {
        Ok(self.state.edges(&self.state.outgoing, id))
    }

    fn edges_to(&self, id: EntityId) -> Result<Vec<StitchEdge>> {
        Ok(self.state.edges(&self.state.incoming, id))
    }

    fn data_source(&self, key: &str) -> Result<Option<DataSourceRecord>> {
        Ok(self.state.data_sources.get(key).cloned())
    }

    fn data_sources(&self) -> Result<Vec<DataSourceRecord>> {
        Ok(self.state.data_sources())
    }
}

impl GraphTx for MemoryTx<'_> {
    fn create_entity(
        &mut self,
        payload: Payload,
        labels: BTreeSet<String>,
        source: Option<&str>,
    ) -> Result<EntityId> {
        let entity = EntityNode::new(payload, labels, source.map(str::to_string));
        let id = entity.id;
        self.state.entities.insert(id, entity);
        self.journal.push(Undo::CreatedEntity(id));
        Ok(id)
    }

    fn merge_entity_payload(&mut self, id: EntityId, payload: &Payload) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let entity = self.entity_mut(id)?;
        let previous = entity.payload.clone();
        merge_payload(&mut entity.payload, payload);
        self.journal.push(Undo::Payload { id, previous });
        Ok(())
    }

    fn add_label(&mut self, id: EntityId, label: &str) -> Result<bool> {
        let added = self.entity_mut(id)?.labels.insert(label.to_string());
        if added {
            self.journal.push(Undo::Label { id, label: label.to_string() });
        }
        Ok(added)
    }

    fn index(&mut self, id: EntityId, key: &IndexKey, value: &str) -> Result<bool> {
        if !self.state.entities.contains_key(&id) {
            return Err(DbError::NotFound(id.to_string()));
        }
        let added = self
            .state
            .index
            .entry(key.clone())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(id);
        if added {
            self.journal.push(Undo::Indexed {
                key: key.clone(),
                value: value.to_string(),
                id,
            });
        }
        Ok(added)
    }

    fn create_edge(
        &mut self,
        from: EntityId,
        to: EntityId,
        kind: RelationKind,
        key_value: &str,
        attrs: Payload,
    ) -> Result<EdgeId> {
        for end in [from, to] {
            if !self.state.entities.contains_key(&end) {
                return Err(DbError::NotFound(end.to_string()));
            }
        }
        let edge = StitchEdge::new(from, to, kind, key_value, attrs);
        let id = edge.id;
        self.state.insert_edge(edge);
        self.journal.push(Undo::CreatedEdge(id));
        Ok(id)
    }

    fn merge_edge_attrs(&mut self, id: EdgeId, attrs: &Payload) -> Result<()> {
        if attrs.is_empty() {
            return Ok(());
        }
        let edge = self
            .state
            .edges
            .get_mut(&id)
            .ok_or_else(|| DbError::EdgeNotFound(id.to_string()))?;
        let previous = edge.attrs.clone();
        merge_payload(&mut edge.attrs, attrs);
        self.journal.push(Undo::EdgeAttrs { id, previous });
        Ok(())
    }

    fn put_data_source(&mut self, mut record: DataSourceRecord) -> Result<()> {
        record.updated_at = Utc::now();
        let key = record.key.clone();
        let previous = self.state.data_sources.insert(key.clone(), record);
        self.journal.push(Undo::DataSource { key, previous });
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        debug!(writes = self.journal.len(), "Committed transaction");
        self.journal.clear();
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.undo();
        self.open = false;
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if self.open && !self.journal.is_empty() {
            warn!(writes = self.journal.len(), "Transaction dropped without commit, rolling back");
            self.undo();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
