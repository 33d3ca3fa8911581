//! Identity key resolution.
//!
//! A `KeyResolver` is built once per adapter from its binding table and is
//! immutable afterwards. It is consulted at registration time (what to
//! index) and at stitch time (what to look up), so both sides always agree
//! on the normalised form of a key.
//!
//! Usage:
//! ```ignore
//! let resolver = KeyResolver::new()
//!     .bind(KeyBinding::new("synonyms", KeyType::Name).separator("|").blacklist(["Unknown"]))
//!     .bind(KeyBinding::new("unii", KeyType::Unii));
//! let resolution = resolver.resolve(&record);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use stitcher_common::value::FieldDiagnostic;
use stitcher_common::{KeyPair, KeyType, RawRecord, SourceConfig, Value};
use tracing::{trace, warn};

// ── Mappers ───────────────────────────────────────────────────────────────────

/// Custom per-field mapping that replaces default splitting.
///
/// Returns raw (not yet normalised) values, possibly for several key types.
pub trait KeyMapper: fmt::Debug + Send + Sync {
    fn map(&self, raw: &str) -> Vec<(KeyType, String)>;
}

/// Extracts key values with regular expressions.
///
/// Every match is trimmed and stripped of `"`. Non-numeric matches shorter
/// than `min_len` are dropped; with `normalized` set they are upper-cased.
/// Blacklisted and repeated values are dropped, first-seen order is kept.
#[derive(Debug, Clone, Default)]
pub struct RegexKeyMapper {
    patterns: Vec<(KeyType, Regex)>,
    min_len: usize,
    normalized: bool,
    prefix: Option<String>,
    blacklist: HashSet<String>,
}

impl RegexKeyMapper {
    pub fn new() -> Self {
        Self { min_len: 1, ..Default::default() }
    }

    /// Add a pattern for `key`. One mapper may serve several key types.
    pub fn add(&mut self, key: KeyType, pattern: &str) -> Result<(), regex::Error> {
        self.patterns.push((key, Regex::new(pattern)?));
        Ok(())
    }

    pub fn min_len(mut self, min_len: usize) -> Self {
        self.min_len = min_len;
        self
    }

    pub fn normalized(mut self, normalized: bool) -> Self {
        self.normalized = normalized;
        self
    }

    /// Literal prefix prepended to every extracted value.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_blacklist<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist
            .extend(values.into_iter().map(|v| v.as_ref().to_uppercase()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl KeyMapper for RegexKeyMapper {
    fn map(&self, raw: &str) -> Vec<(KeyType, String)> {
        let mut out: Vec<(KeyType, String)> = Vec::new();
        for (key, pattern) in &self.patterns {
            for m in pattern.find_iter(raw) {
                let mut value = m.as_str().trim().replace('"', "");
                if !key.is_numeric() && value.chars().count() < self.min_len {
                    continue;
                }
                if self.normalized {
                    value = value.to_uppercase();
                }
                if value.is_empty() || self.blacklist.contains(&value.to_uppercase()) {
                    continue;
                }
                if let Some(prefix) = &self.prefix {
                    value = format!("{prefix}{value}");
                }
                if !out.iter().any(|(k, v)| k == key && *v == value) {
                    out.push((*key, value));
                }
            }
        }
        out
    }
}

/// Prepends a literal prefix (e.g. `"UNII:"`) to each value.
#[derive(Debug, Clone)]
pub struct PrefixKeyMapper {
    key: KeyType,
    prefix: String,
    separator: Option<String>,
}

impl PrefixKeyMapper {
    pub fn new(key: KeyType, prefix: impl Into<String>) -> Self {
        Self { key, prefix: prefix.into(), separator: None }
    }

    pub fn separator(mut self, separator: Option<String>) -> Self {
        self.separator = separator;
        self
    }
}

impl KeyMapper for PrefixKeyMapper {
    fn map(&self, raw: &str) -> Vec<(KeyType, String)> {
        split_dedup(raw, self.separator.as_deref())
            .into_iter()
            .map(|v| (self.key, format!("{}{}", self.prefix, v)))
            .collect()
    }
}

/// Trim, split on `separator`, drop blanks, dedup keeping first-seen order.
fn split_dedup(raw: &str, separator: Option<&str>) -> Vec<String> {
    let parts: Vec<&str> = match separator {
        Some(sep) if !sep.is_empty() => raw.split(sep).collect(),
        _ => vec![raw],
    };
    let mut seen = HashSet::new();
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

// ── Bindings ──────────────────────────────────────────────────────────────────

/// One entry of an adapter's binding table: field -> KeyType.
#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub field: String,
    pub key: KeyType,
    pub separator: Option<String>,
    /// Lower-cased noise values for this (key, field)
    blacklist: HashSet<String>,
    mapper: Option<Arc<dyn KeyMapper>>,
}

impl KeyBinding {
    pub fn new(field: impl Into<String>, key: KeyType) -> Self {
        Self {
            field: field.into(),
            key,
            separator: None,
            blacklist: HashSet::new(),
            mapper: None,
        }
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    /// Case-insensitive values dropped before they reach the index.
    pub fn blacklist<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist
            .extend(values.into_iter().map(|v| v.as_ref().trim().to_lowercase()));
        self
    }

    pub fn mapper(mut self, mapper: impl KeyMapper + 'static) -> Self {
        self.mapper = Some(Arc::new(mapper));
        self
    }

    pub fn has_mapper(&self) -> bool {
        self.mapper.is_some()
    }

    pub fn is_blacklisted(&self, value: &str) -> bool {
        self.blacklist.contains(&value.trim().to_lowercase())
    }

    /// Raw candidates for one scalar value, before blacklisting and normalisation.
    fn candidates(&self, raw: &str) -> Vec<(KeyType, String)> {
        match &self.mapper {
            Some(mapper) => mapper.map(raw),
            None => split_dedup(raw, self.separator.as_deref())
                .into_iter()
                .map(|v| (self.key, v))
                .collect(),
        }
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

/// Everything the resolver derived from one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyResolution {
    /// Normalised pairs to index, deduplicated, first-seen order
    pub pairs: Vec<KeyPair>,
    /// Keyword values, applied as entity labels
    pub labels: Vec<String>,
    /// Values that failed normalisation
    pub diagnostics: Vec<FieldDiagnostic>,
    /// Bound fields that produced at least one accepted value
    pub accepted_fields: BTreeSet<String>,
}

impl KeyResolution {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.labels.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    bindings: Vec<KeyBinding>,
    /// Per-KeyType lower-cased blacklist, regardless of field
    blacklist: HashMap<KeyType, HashSet<String>>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, binding: KeyBinding) -> Self {
        self.add_binding(binding);
        self
    }

    pub fn add_binding(&mut self, binding: KeyBinding) {
        self.bindings.push(binding);
    }

    pub fn blacklist_key<I, S>(&mut self, key: KeyType, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist
            .entry(key)
            .or_default()
            .extend(values.into_iter().map(|v| v.as_ref().trim().to_lowercase()));
    }

    /// Build from an adapter configuration. Stitch entries whose patterns
    /// are all invalid are logged and skipped.
    pub fn from_config(config: &SourceConfig) -> Self {
        let mut resolver = Self::new();

        for spec in &config.stitches {
            let mut binding = KeyBinding::new(&spec.property, spec.key).blacklist(&spec.blacklist);
            if let Some(sep) = &spec.separator {
                binding = binding.separator(sep);
            }

            if !spec.regex.is_empty() {
                let mut mapper = RegexKeyMapper::new()
                    .min_len(spec.min_len)
                    .normalized(spec.normalize);
                for pattern in &spec.regex {
                    if let Err(e) = mapper.add(spec.key, pattern) {
                        warn!(key = %spec.key, property = %spec.property, %pattern, error = %e, "Invalid stitch pattern");
                    }
                }
                if mapper.is_empty() {
                    warn!(key = %spec.key, property = %spec.property, "Skipping stitch entry with no valid pattern");
                    continue;
                }
                if let Some(prefix) = &spec.prefix {
                    mapper = mapper.with_prefix(prefix);
                }
                binding = binding.mapper(mapper);
            } else if let Some(prefix) = &spec.prefix {
                binding = binding.mapper(PrefixKeyMapper::new(spec.key, prefix).separator(spec.separator.clone()));
            }

            resolver.add_binding(binding);
        }

        for entry in &config.blacklist {
            resolver.blacklist_key(entry.key, &entry.values);
        }
        resolver
    }

    pub fn bindings(&self) -> &[KeyBinding] {
        &self.bindings
    }

    pub fn is_bound(&self, field: &str) -> bool {
        self.bindings.iter().any(|b| b.field == field)
    }

    /// Key types in binding order, without repeats.
    pub fn key_types(&self) -> Vec<KeyType> {
        let mut keys = Vec::new();
        for b in &self.bindings {
            if !keys.contains(&b.key) {
                keys.push(b.key);
            }
        }
        keys
    }

    /// Fields bound to `key`.
    pub fn properties_for(&self, key: KeyType) -> Vec<&str> {
        self.bindings
            .iter()
            .filter(|b| b.key == key)
            .map(|b| b.field.as_str())
            .collect()
    }

    fn globally_blacklisted(&self, key: KeyType, value: &str) -> bool {
        self.blacklist
            .get(&key)
            .map(|values| values.contains(&value.trim().to_lowercase()))
            .unwrap_or(false)
    }

    /// Resolve one raw value through `binding`.
    pub fn resolve_value(&self, binding: &KeyBinding, raw: &str) -> (Vec<KeyPair>, Vec<FieldDiagnostic>) {
        let mut pairs = Vec::new();
        let mut diagnostics = Vec::new();

        for (key, value) in binding.candidates(raw) {
            if binding.is_blacklisted(&value) || self.globally_blacklisted(key, &value) {
                trace!(field = %binding.field, %key, %value, "Blacklisted key value");
                continue;
            }
            match KeyPair::new(key, &value) {
                Ok(pair) => {
                    if !pairs.contains(&pair) {
                        pairs.push(pair);
                    }
                }
                Err(e) => diagnostics.push(FieldDiagnostic::RejectedKey {
                    field: binding.field.clone(),
                    raw: value,
                    reason: e.to_string(),
                }),
            }
        }
        (pairs, diagnostics)
    }

    /// Pairs for a field value, for stitch-time lookups. Rejected values are
    /// silently dropped.
    pub fn resolve_field(&self, field: &str, value: &Value) -> Vec<KeyPair> {
        let mut pairs = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.field == field) {
            for scalar in value.scalars() {
                let (found, _) = self.resolve_value(binding, &scalar.to_key_string());
                for pair in found {
                    if !pairs.contains(&pair) {
                        pairs.push(pair);
                    }
                }
            }
        }
        pairs
    }

    /// Resolve every bound field of a record.
    pub fn resolve(&self, record: &RawRecord) -> KeyResolution {
        let mut resolution = KeyResolution::default();

        for binding in &self.bindings {
            let Some(value) = record.get(&binding.field) else {
                continue;
            };
            for scalar in value.scalars() {
                let (pairs, diagnostics) = self.resolve_value(binding, &scalar.to_key_string());
                if !pairs.is_empty() {
                    resolution.accepted_fields.insert(binding.field.clone());
                }
                for pair in pairs {
                    if pair.key.is_label() {
                        if !resolution.labels.contains(&pair.value) {
                            resolution.labels.push(pair.value);
                        }
                    } else if !resolution.pairs.contains(&pair) {
                        resolution.pairs.push(pair);
                    }
                }
                resolution.diagnostics.extend(diagnostics);
            }
        }
        resolution
    }

    /// A record is filtered out when it carries nothing, or when every field
    /// with a value is bound and none of them produced an accepted key.
    pub fn is_filtered_out(&self, record: &RawRecord, resolution: &KeyResolution) -> bool {
        if record.is_empty() {
            return true;
        }
        let all_bound = record
            .fields()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .all(|(field, _)| self.is_bound(field));
        all_bound && resolution.accepted_fields.is_empty()
    }
}
