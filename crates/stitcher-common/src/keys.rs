//! Identity-key categories ("stitch keys") and their normalisation rules.
//!
//! Every value that goes into, or is looked up from, the entity index is
//! first passed through `KeyType::normalize`, so registration and
//! resolution always agree on the canonical form of a key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StitchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    // Names
    Name,

    // Compound identifiers
    Unii,
    Cas,
    Sid,
    Cid,
    Chembl,
    Drugbank,
    Code,

    // Other identifiers
    Mesh,
    Uniprot,
    Nct,
    Pmid,
    AnyId,
    GeneSymbol,
    Uri,

    // Structural hashes
    Inchikey,
    LychiL1,
    LychiL2,
    LychiL3,
    LychiL4,
    LychiL5,

    // Generic hashes
    Sha1,
    Sha256,
    Md5,

    // URLs
    Wikipedia,
    Doi,

    // Tags
    ActiveMoiety,
    Keyword,
}

/// How a key's raw values are canonicalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    UpperCase,
    CollapsedName,
    Numeric,
    CasNumber,
    Verbatim,
    DoiUrl,
}

impl KeyType {
    pub const ALL: [KeyType; 28] = [
        KeyType::Name, KeyType::Unii, KeyType::Cas, KeyType::Sid, KeyType::Cid,
        KeyType::Chembl, KeyType::Drugbank, KeyType::Code, KeyType::Mesh,
        KeyType::Uniprot, KeyType::Nct, KeyType::Pmid, KeyType::AnyId,
        KeyType::GeneSymbol, KeyType::Uri, KeyType::Inchikey, KeyType::LychiL1,
        KeyType::LychiL2, KeyType::LychiL3, KeyType::LychiL4, KeyType::LychiL5,
        KeyType::Sha1, KeyType::Sha256, KeyType::Md5, KeyType::Wikipedia,
        KeyType::Doi, KeyType::ActiveMoiety, KeyType::Keyword,
    ];

    /// Priority from 1 (lowest) to 5 (highest) when weighing coreference evidence.
    pub fn priority(&self) -> u8 {
        match self {
            KeyType::Sha1 | KeyType::Sha256 | KeyType::ActiveMoiety | KeyType::LychiL5 => 5,
            KeyType::Md5 => 4,
            KeyType::Unii | KeyType::Inchikey => 3,
            KeyType::Name
            | KeyType::Cas
            | KeyType::Cid
            | KeyType::Chembl
            | KeyType::Drugbank
            | KeyType::Mesh
            | KeyType::Uniprot
            | KeyType::Pmid
            | KeyType::GeneSymbol
            | KeyType::LychiL4 => 2,
            _ => 1,
        }
    }

    /// Directed keys imply an asymmetric relationship (e.g. salt -> active moiety).
    pub fn is_directed(&self) -> bool {
        matches!(self, KeyType::ActiveMoiety)
    }

    /// Keys whose values are integers.
    pub fn is_numeric(&self) -> bool {
        matches!(self, KeyType::Sid | KeyType::Cid | KeyType::Pmid | KeyType::AnyId)
    }

    /// Keyword values become entity labels instead of index entries.
    pub fn is_label(&self) -> bool {
        matches!(self, KeyType::Keyword)
    }

    fn rule(&self) -> Rule {
        match self {
            KeyType::Name => Rule::CollapsedName,
            KeyType::Cas => Rule::CasNumber,
            k if k.is_numeric() => Rule::Numeric,
            KeyType::Uri | KeyType::Wikipedia | KeyType::Keyword => Rule::Verbatim,
            KeyType::Doi => Rule::DoiUrl,
            _ => Rule::UpperCase,
        }
    }

    /// Canonicalise a raw value for this key. Empty or malformed values are rejected.
    pub fn normalize(&self, raw: &str) -> Result<String> {
        let trimmed = raw.trim();
        let value = match self.rule() {
            Rule::UpperCase => trimmed.to_uppercase(),
            Rule::Verbatim => trimmed.to_string(),
            Rule::CollapsedName => trimmed
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_uppercase(),
            Rule::Numeric => match trimmed.parse::<i64>() {
                Ok(v) => v.to_string(),
                Err(_) => return Err(self.invalid(raw)),
            },
            Rule::CasNumber => {
                let cas = trimmed.to_uppercase();
                if !is_valid_cas(&cas) {
                    return Err(self.invalid(raw));
                }
                cas
            }
            Rule::DoiUrl => {
                let lower = trimmed.to_lowercase();
                let stripped = ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "doi:"]
                    .iter()
                    .find_map(|p| lower.strip_prefix(*p))
                    .unwrap_or(&lower);
                stripped.trim().to_string()
            }
        };

        if value.is_empty() {
            return Err(self.invalid(raw));
        }
        Ok(value)
    }

    fn invalid(&self, raw: &str) -> StitchError {
        StitchError::InvalidKey { key: *self, value: raw.to_string() }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Name => "name",
            KeyType::Unii => "unii",
            KeyType::Cas => "cas",
            KeyType::Sid => "sid",
            KeyType::Cid => "cid",
            KeyType::Chembl => "chembl",
            KeyType::Drugbank => "drugbank",
            KeyType::Code => "code",
            KeyType::Mesh => "mesh",
            KeyType::Uniprot => "uniprot",
            KeyType::Nct => "nct",
            KeyType::Pmid => "pmid",
            KeyType::AnyId => "any_id",
            KeyType::GeneSymbol => "gene_symbol",
            KeyType::Uri => "uri",
            KeyType::Inchikey => "inchikey",
            KeyType::LychiL1 => "lychi_l1",
            KeyType::LychiL2 => "lychi_l2",
            KeyType::LychiL3 => "lychi_l3",
            KeyType::LychiL4 => "lychi_l4",
            KeyType::LychiL5 => "lychi_l5",
            KeyType::Sha1 => "sha1",
            KeyType::Sha256 => "sha256",
            KeyType::Md5 => "md5",
            KeyType::Wikipedia => "wikipedia",
            KeyType::Doi => "doi",
            KeyType::ActiveMoiety => "active_moiety",
            KeyType::Keyword => "keyword",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        KeyType::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| StitchError::Config(format!("Unknown key type: {s}")))
    }
}

/// A normalised (KeyType, value) pair as written to or read from the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPair {
    pub key: KeyType,
    pub value: String,
}

impl KeyPair {
    /// Normalise `raw` under `key`.
    pub fn new(key: KeyType, raw: &str) -> Result<Self> {
        Ok(Self { key, value: key.normalize(raw)? })
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// CAS registry number: 2-7 digits, 2 digits, check digit, with a valid checksum.
fn is_valid_cas(cas: &str) -> bool {
    let parts: Vec<&str> = cas.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let (head, mid, check) = (parts[0], parts[1], parts[2]);
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !(2..=7).contains(&head.len()) || mid.len() != 2 || check.len() != 1 {
        return false;
    }
    if !all_digits(head) || !all_digits(mid) || !all_digits(check) {
        return false;
    }

    let body: Vec<u32> = head
        .chars()
        .chain(mid.chars())
        .filter_map(|c| c.to_digit(10))
        .collect();
    let sum: u32 = body
        .iter()
        .rev()
        .enumerate()
        .map(|(i, d)| (i as u32 + 1) * d)
        .sum();
    check.chars().next().and_then(|c| c.to_digit(10)) == Some(sum % 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_collapses_whitespace_and_uppercases() {
        assert_eq!(KeyType::Name.normalize("  acetyl   salicylic acid ").unwrap(), "ACETYL SALICYLIC ACID");
    }

    #[test]
    fn test_numeric_keys_reject_text() {
        assert_eq!(KeyType::Pmid.normalize(" 00123 ").unwrap(), "123");
        assert!(KeyType::Cid.normalize("abc").is_err());
    }

    #[test]
    fn test_cas_check_digit() {
        assert_eq!(KeyType::Cas.normalize("7732-18-5").unwrap(), "7732-18-5"); // water
        assert_eq!(KeyType::Cas.normalize("50-78-2").unwrap(), "50-78-2"); // aspirin
        assert!(KeyType::Cas.normalize("50-78-3").is_err());
        assert!(KeyType::Cas.normalize("N/A").is_err());
    }

    #[test]
    fn test_uri_is_case_sensitive() {
        let uri = "http://purl.obolibrary.org/obo/HP_0000118";
        assert_eq!(KeyType::Uri.normalize(uri).unwrap(), uri);
    }

    #[test]
    fn test_doi_prefix_stripped() {
        assert_eq!(KeyType::Doi.normalize("https://doi.org/10.1000/ABC").unwrap(), "10.1000/abc");
    }

    #[test]
    fn test_empty_rejected() {
        assert!(KeyType::Unii.normalize("   ").is_err());
    }

    #[test]
    fn test_from_str_roundtrip() {
        for key in KeyType::ALL {
            assert_eq!(key.as_str().parse::<KeyType>().unwrap(), key);
        }
        assert!("nope".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_priorities_in_range() {
        assert!(KeyType::ALL.iter().all(|k| (1..=5).contains(&k.priority())));
        assert!(KeyType::ActiveMoiety.is_directed());
        assert!(!KeyType::Name.is_directed());
    }
}
