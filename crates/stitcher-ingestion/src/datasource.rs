//! DataSource registry: per-batch provenance and idempotency bookkeeping.
//!
//! Every ingestion batch registers (or fetches) its DataSource by stable
//! name before touching the graph. A DataSource whose instance count is
//! already positive has been ingested; the batch is skipped. Re-ingestion
//! has to be explicit because batches can be slow or remote.

use std::path::Path;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use stitcher_common::{Payload, Result, SourceConfig, StitchError};
use stitcher_db::{DataSourceRecord, GraphStore};
use tracing::{info, instrument};

use crate::digest::{digest_file, file_uri};

/// Length of a DataSource key in hex characters.
pub const SOURCE_KEY_LEN: usize = 9;

/// A registered DataSource as seen at the start of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHandle {
    record: DataSourceRecord,
}

impl SourceHandle {
    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Label attached to every entity this source registers.
    pub fn label(&self) -> String {
        self.record.label()
    }

    pub fn instances(&self) -> u64 {
        self.record.instances
    }

    /// True when the batch must be skipped.
    pub fn is_ingested(&self) -> bool {
        self.record.is_ingested()
    }

    pub fn record(&self) -> &DataSourceRecord {
        &self.record
    }
}

/// What a finished batch records on its DataSource.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub instances: u64,
    /// Content checksum, when the input was streamed through a digest
    pub sha1: Option<String>,
    pub size: Option<u64>,
    /// Observed property names in first-seen order
    pub properties: Vec<String>,
    pub metadata: Payload,
}

#[derive(Clone)]
pub struct DataSourceRegistry {
    graph: Arc<dyn GraphStore>,
}

impl DataSourceRegistry {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    /// Stable key for a name or content digest: first 9 hex chars of SHA-1.
    pub fn source_key(text: &str) -> String {
        let digest = hex::encode(Sha1::digest(text.as_bytes()));
        digest[..SOURCE_KEY_LEN].to_string()
    }

    /// Register or fetch a DataSource by name.
    pub fn register(&self, name: &str) -> Result<SourceHandle> {
        self.register_with_uri(name, None)
    }

    /// Register or fetch a DataSource by name, recording its origin locator.
    pub fn register_with_uri(&self, name: &str, uri: Option<&str>) -> Result<SourceHandle> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StitchError::Config("data source name must not be empty".to_string()));
        }
        let key = Self::source_key(name);
        self.fetch_or_create(&key, name, |record| {
            record.uri = uri.map(str::to_string);
        })
    }

    /// Register the DataSource an adapter config names, with its configured
    /// origin locator as the uri.
    pub fn register_config(&self, config: &SourceConfig) -> Result<SourceHandle> {
        self.register_with_uri(&config.source.name, config.source.data.as_deref())
    }

    /// Register a local file. The key derives from the file content; name
    /// defaults to the file name.
    pub fn register_file(&self, name: Option<&str>, path: impl AsRef<Path>) -> Result<SourceHandle> {
        let path = path.as_ref();
        let (sha1, size) = digest_file(path)?;
        let uri = file_uri(path)?;
        let name = match name {
            Some(n) => n.trim().to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| uri.clone()),
        };
        let key = sha1[..SOURCE_KEY_LEN].to_string();
        self.fetch_or_create(&key, &name, |record| {
            record.uri = Some(uri.clone());
            record.sha1 = Some(sha1.clone());
            record.size = Some(size);
        })
    }

    fn fetch_or_create(
        &self,
        key: &str,
        name: &str,
        init: impl FnOnce(&mut DataSourceRecord),
    ) -> Result<SourceHandle> {
        if let Some(record) = self.graph.data_source(key)? {
            if record.is_ingested() {
                info!(
                    source = %record.name,
                    key = %record.key,
                    instances = record.instances,
                    "Data source already registered with {} entities, skipping",
                    record.instances
                );
            }
            return Ok(SourceHandle { record });
        }

        let mut record = DataSourceRecord::new(key, name);
        init(&mut record);

        let mut tx = self.graph.begin()?;
        tx.put_data_source(record.clone())?;
        tx.commit()?;

        info!(source = %record.name, key = %record.key, uri = ?record.uri, "Data source created");
        Ok(SourceHandle { record })
    }

    pub fn get(&self, key: &str) -> Result<Option<DataSourceRecord>> {
        Ok(self.graph.data_source(key)?)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<DataSourceRecord>> {
        Ok(self.graph.data_sources()?.into_iter().find(|ds| ds.name == name))
    }

    /// Every registered DataSource ordered by name.
    pub fn data_sources(&self) -> Result<Vec<DataSourceRecord>> {
        Ok(self.graph.data_sources()?)
    }

    /// Atomically record a finished batch on its DataSource.
    #[instrument(skip(self, completion), fields(source = %handle.name()))]
    pub fn complete(&self, handle: &SourceHandle, completion: Completion) -> Result<DataSourceRecord> {
        let mut tx = self.graph.begin()?;
        let mut record = tx
            .data_source(handle.key())?
            .unwrap_or_else(|| handle.record.clone());

        record.instances = completion.instances;
        if completion.sha1.is_some() {
            record.sha1 = completion.sha1;
        }
        if completion.size.is_some() {
            record.size = completion.size;
        }
        for property in completion.properties {
            if !record.properties.contains(&property) {
                record.properties.push(property);
            }
        }
        record.metadata.extend(completion.metadata);

        tx.put_data_source(record.clone())?;
        tx.commit()?;

        info!(
            source = %record.name,
            key = %record.key,
            instances = record.instances,
            properties = record.properties.len(),
            "Data source completed"
        );
        Ok(record)
    }
}
