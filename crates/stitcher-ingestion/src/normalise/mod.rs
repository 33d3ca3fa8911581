//! Identity key normalisation.
//!
//! - `KeyResolver`: maps record fields to normalised (KeyType, value) pairs
//!   per the adapter's binding table, with blacklists and custom mappers
//! - `RuleSet`: declarative cleanup of candidate cross-references

pub mod keys;
pub mod rules;

pub use keys::{
    KeyBinding, KeyMapper, KeyResolution, KeyResolver, PrefixKeyMapper, RegexKeyMapper,
};
pub use rules::{RuleAction, RuleSet};
