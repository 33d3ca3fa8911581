//! Declarative cross-reference cleanup.
//!
//! Ontology dumps carry many cross-references that are noise (editor
//! notes, literature ids) or that need rewriting before they line up with
//! another source's identifiers. Adapters run every candidate
//! `(relation, value)` through a `RuleSet` before handing it to the
//! stitcher. The first rule whose pattern matches the value decides; no
//! match passes the pair through unchanged.

use std::borrow::Cow;

use regex::Regex;
use stitcher_common::{RelationKind, RuleActionSpec, RuleSpec};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum RuleAction {
    Drop,
    Reclassify(RelationKind),
    /// Regex replacement, `$1`-style group references allowed
    Rewrite(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    action: RuleAction,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pattern: &str, action: RuleAction) -> Result<(), regex::Error> {
        self.rules.push(Rule { pattern: Regex::new(pattern)?, action });
        Ok(())
    }

    /// Compile configured rules. Invalid patterns and empty relation names
    /// are logged and skipped.
    pub fn from_specs(specs: &[RuleSpec]) -> Self {
        let mut set = Self::new();
        for spec in specs {
            let action = match &spec.action {
                RuleActionSpec::Drop => RuleAction::Drop,
                RuleActionSpec::Rewrite { replacement } => RuleAction::Rewrite(replacement.clone()),
                RuleActionSpec::Reclassify { relation } => match relation.parse::<RelationKind>() {
                    Ok(kind) => RuleAction::Reclassify(kind),
                    Err(e) => {
                        warn!(pattern = %spec.pattern, error = %e, "Skipping cleanup rule");
                        continue;
                    }
                },
            };
            if let Err(e) = set.push(&spec.pattern, action) {
                warn!(pattern = %spec.pattern, error = %e, "Skipping cleanup rule with invalid pattern");
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the first matching rule. `None` means the pair was dropped.
    pub fn apply<'v>(&self, kind: &RelationKind, value: &'v str) -> Option<(RelationKind, Cow<'v, str>)> {
        let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(value)) else {
            return Some((kind.clone(), Cow::Borrowed(value)));
        };
        match &rule.action {
            RuleAction::Drop => None,
            RuleAction::Reclassify(to) => Some((to.clone(), Cow::Borrowed(value))),
            RuleAction::Rewrite(replacement) => {
                Some((kind.clone(), rule.pattern.replace(value, replacement.as_str())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RuleSet {
        let mut set = RuleSet::new();
        set.push("^(OBOL|GOC|ISBN):", RuleAction::Drop).unwrap();
        set.push("^ICD", RuleAction::Reclassify(RelationKind::Related("hasIcd".into()))).unwrap();
        set.push("^UMLS_CUI:", RuleAction::Rewrite("UMLS:".into())).unwrap();
        set.push("^UMLS", RuleAction::Drop).unwrap();
        set
    }

    #[test]
    fn test_first_match_wins() {
        let set = rules();
        let (kind, value) = set.apply(&RelationKind::ExactMatch, "UMLS_CUI:C0006142").unwrap();
        assert_eq!(kind, RelationKind::ExactMatch);
        assert_eq!(value, "UMLS:C0006142");
        assert!(set.apply(&RelationKind::ExactMatch, "UMLS:C0006142").is_none());
    }

    #[test]
    fn test_drop_and_reclassify() {
        let set = rules();
        assert!(set.apply(&RelationKind::CloseMatch, "ISBN:123").is_none());
        let (kind, value) = set.apply(&RelationKind::CloseMatch, "ICD10:C50").unwrap();
        assert_eq!(kind, RelationKind::Related("hasIcd".into()));
        assert_eq!(value, "ICD10:C50");
    }

    #[test]
    fn test_no_match_passes_through() {
        let (kind, value) = rules().apply(&RelationKind::SubClassOf, "MESH:D001943").unwrap();
        assert_eq!(kind, RelationKind::SubClassOf);
        assert!(matches!(value, Cow::Borrowed("MESH:D001943")));
    }

    #[test]
    fn test_from_specs_skips_invalid() {
        let specs: Vec<RuleSpec> = serde_yaml::from_str(
            r#"
- pattern: "^OBOL:"
  action: drop
- pattern: "(bad"
  action: drop
- pattern: "^ICD"
  action: reclassify
  relation: hasIcd10
- pattern: "^UMLS_CUI"
  action: rewrite
  replacement: UMLS
"#,
        )
        .unwrap();
        let set = RuleSet::from_specs(&specs);
        assert_eq!(set.len(), 3);
        let (_, value) = set.apply(&RelationKind::ExactMatch, "UMLS_CUI:C1").unwrap();
        assert_eq!(value, "UMLS:C1");
    }
}
