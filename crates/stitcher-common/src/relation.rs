//! Relationship kinds carried by stitch edges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StitchError;
use crate::keys::KeyType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    SubClassOf,
    EquivalentClass,
    ExactMatch,
    CloseMatch,
    HasPhenotype,
    InteractsWith,
    ActiveMoietyOf,
    DiseaseAssociatedGene,
    /// Two entities from different sources denote the same concept, evidenced by a shared key.
    Coreference(KeyType),
    /// Any other named relationship.
    Related(String),
}

impl RelationKind {
    pub fn is_coreference(&self) -> bool {
        matches!(self, RelationKind::Coreference(_))
    }

    /// Symmetric kinds match an existing edge in either direction.
    pub fn is_symmetric(&self) -> bool {
        match self {
            RelationKind::EquivalentClass
            | RelationKind::ExactMatch
            | RelationKind::CloseMatch
            | RelationKind::InteractsWith => true,
            RelationKind::Coreference(key) => !key.is_directed(),
            _ => false,
        }
    }

    pub fn name(&self) -> String {
        match self {
            RelationKind::SubClassOf => "subClassOf".to_string(),
            RelationKind::EquivalentClass => "equivalentClass".to_string(),
            RelationKind::ExactMatch => "exactMatch".to_string(),
            RelationKind::CloseMatch => "closeMatch".to_string(),
            RelationKind::HasPhenotype => "hasPhenotype".to_string(),
            RelationKind::InteractsWith => "interactsWith".to_string(),
            RelationKind::ActiveMoietyOf => "activeMoietyOf".to_string(),
            RelationKind::DiseaseAssociatedGene => "diseaseAssociatedGene".to_string(),
            RelationKind::Coreference(key) => format!("coref:{key}"),
            RelationKind::Related(name) => name.clone(),
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for RelationKind {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(StitchError::Config("Empty relation name".to_string()));
        }
        if let Some(key) = s.strip_prefix("coref:") {
            return Ok(RelationKind::Coreference(key.parse()?));
        }
        Ok(match s {
            "subClassOf" => RelationKind::SubClassOf,
            "equivalentClass" => RelationKind::EquivalentClass,
            "exactMatch" => RelationKind::ExactMatch,
            "closeMatch" => RelationKind::CloseMatch,
            "hasPhenotype" => RelationKind::HasPhenotype,
            "interactsWith" => RelationKind::InteractsWith,
            "activeMoietyOf" => RelationKind::ActiveMoietyOf,
            "diseaseAssociatedGene" => RelationKind::DiseaseAssociatedGene,
            other => RelationKind::Related(other.to_string()),
        })
    }
}
