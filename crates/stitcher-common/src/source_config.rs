//! Declarative adapter configuration.
//!
//! One `SourceConfig` describes how a source adapter's records map onto
//! identity keys: the id field, the stitch bindings, noise blacklists,
//! references to previously ingested sources, and the cross-reference
//! cleanup rules. Loaded once at adapter startup from YAML, TOML or JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StitchError;
use crate::keys::KeyType;

/// Complete adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Which data source this adapter feeds
    pub source: SourceSpec,

    /// Field -> KeyType bindings
    #[serde(default)]
    pub stitches: Vec<StitchSpec>,

    /// Values that are noise for a KeyType regardless of field
    #[serde(default)]
    pub blacklist: Vec<BlacklistSpec>,

    /// Previously ingested sources this one attaches to
    #[serde(default)]
    pub references: Vec<ReferenceSpec>,

    /// Cross-reference cleanup rules, first match wins
    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    /// Streaming extraction settings for multi-record dumps
    #[serde(default)]
    pub extractor: Option<ExtractorSpec>,
}

// ── Source ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Stable data source name (e.g., "ClinVar Variation")
    pub name: String,

    /// Origin locator: path or URL of the input
    #[serde(default)]
    pub data: Option<String>,

    /// Field whose value identifies a record within this source
    #[serde(default, alias = "idf")]
    pub id_field: Option<String>,

    /// Preferred display-name field
    #[serde(default, alias = "namef")]
    pub name_field: Option<String>,
}

// ── Stitches ──────────────────────────────────────────────────────────────────

/// One field binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchSpec {
    pub key: KeyType,

    /// Record field the key values come from
    pub property: String,

    /// Composite values are split on this separator (e.g. "|")
    #[serde(default)]
    pub separator: Option<String>,

    /// Regex mapper patterns; when present they replace default splitting
    #[serde(default, deserialize_with = "one_or_many")]
    pub regex: Vec<String>,

    /// Minimum length of a regex match to be kept
    #[serde(default = "default_min_len", alias = "minlen")]
    pub min_len: usize,

    /// Upper-case regex matches before blacklisting
    #[serde(default)]
    pub normalize: bool,

    /// Literal prefix prepended to every value (e.g. "UNII:")
    #[serde(default)]
    pub prefix: Option<String>,

    /// Case-insensitive noise values for this (key, field)
    #[serde(default, deserialize_with = "one_or_many")]
    pub blacklist: Vec<String>,
}

fn default_min_len() -> usize { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistSpec {
    pub key: KeyType,
    #[serde(deserialize_with = "one_or_many")]
    pub values: Vec<String>,
}

// ── References ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSpec {
    /// Name of the referenced data source
    pub name: String,

    /// Key used to find entities of the referenced source
    pub key: KeyType,

    /// Record field holding the reference value; defaults to the id field
    #[serde(default)]
    pub id: Option<String>,
}

// ── Cleanup rules ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Regex matched against the candidate key value
    pub pattern: String,

    #[serde(flatten)]
    pub action: RuleActionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleActionSpec {
    Drop,
    Reclassify { relation: String },
    Rewrite { replacement: String },
}

// ── Extractor ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorSpec {
    /// Record element name (e.g. "VariationArchive")
    pub tag: String,

    /// Records larger than this are dropped
    #[serde(default)]
    pub max_record_bytes: Option<usize>,
}

/// Accept either a single string or a list of strings.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

// ── Helper Methods ─────────────────────────────────────────────────────────────

impl SourceConfig {
    /// Minimal configuration for a named source with no bindings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            source: SourceSpec {
                name: name.into(),
                data: None,
                id_field: None,
                name_field: None,
            },
            stitches: vec![],
            blacklist: vec![],
            references: vec![],
            rules: vec![],
            extractor: None,
        }
    }

    /// Load from YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file
    pub fn from_toml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON file
    pub fn from_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load by file extension (.yaml/.yml, .toml, .json).
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(path),
            Some("toml") => Self::from_toml(path),
            Some("json") => Self::from_json(path),
            _ => anyhow::bail!("Unsupported config format: {}", path.display()),
        }
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<(), StitchError> {
        if self.source.name.trim().is_empty() {
            return Err(StitchError::Config("source.name must not be empty".to_string()));
        }
        if let Some(spec) = self.stitches.iter().find(|s| s.property.trim().is_empty()) {
            return Err(StitchError::Config(format!(
                "stitch for key {} has an empty property",
                spec.key
            )));
        }
        if let Some(extractor) = &self.extractor {
            if extractor.tag.trim().is_empty() {
                return Err(StitchError::Config("extractor.tag must not be empty".to_string()));
            }
        }
        for reference in &self.references {
            if reference.id.is_none() && self.source.id_field.is_none() {
                return Err(StitchError::Config(format!(
                    "reference to {:?} has no id field and the source declares none",
                    reference.name
                )));
            }
        }
        Ok(())
    }

    /// Record field holding a reference's lookup value.
    pub fn reference_field<'a>(&'a self, reference: &'a ReferenceSpec) -> Option<&'a str> {
        reference.id.as_deref().or(self.source.id_field.as_deref())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
